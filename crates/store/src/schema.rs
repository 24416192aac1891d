// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Immutable table schema descriptions. Schema changes never mutate in
//! place; DDL produces a new schema version bound to a new table version.

use crate::error::{Error, StructuralError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The logical type of a column. The byte-level encoding of cell values is
/// the concern of the layer above; the core stores and compares cells only.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    String,
    Numeric,
    Time,
    Binary,
    Boolean,
    Object,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnType::String => "STRING",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Time => "TIME",
            ColumnType::Binary => "BINARY",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Object => "OBJECT",
        };
        f.write_str(s)
    }
}

/// Description of one column. Immutable after table creation; equality is
/// structural.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub column_type: ColumnType,
    pub size: Option<usize>,
    pub not_null: bool,
    pub unique: bool,
    /// Columns sharing a non-negative group id form a composite uniqueness
    /// group. -1 means none.
    pub unique_group: i32,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            size: None,
            not_null: false,
            unique: false,
            unique_group: -1,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn unique_group(mut self, group: i32) -> Self {
        self.unique_group = group;
        self
    }
}

/// An ordered sequence of column descriptions identifying a table version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnDescription>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDescription>) -> Result<Self, Error> {
        if columns.is_empty() {
            return Err(StructuralError::EmptySchema.into());
        }
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.name.as_str()) {
                return Err(StructuralError::DuplicateColumn(c.name.clone()).into());
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&ColumnDescription> {
        self.columns.get(index)
    }

    /// Position and description of the column with the given name.
    pub fn column_named(&self, name: &str) -> Option<(usize, &ColumnDescription)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_structural_equality() {
        let a = TableSchema::new(vec![
            ColumnDescription::new("Account", ColumnType::Numeric).not_null(),
            ColumnDescription::new("AccDesc", ColumnType::String).with_size(60),
        ])
        .unwrap();
        let b = TableSchema::new(vec![
            ColumnDescription::new("Account", ColumnType::Numeric).not_null(),
            ColumnDescription::new("AccDesc", ColumnType::String).with_size(60),
        ])
        .unwrap();
        assert_eq!(a, b);

        let c = TableSchema::new(vec![ColumnDescription::new(
            "Account",
            ColumnType::Numeric,
        )])
        .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejects_duplicate_and_empty() {
        assert!(matches!(
            TableSchema::new(vec![]),
            Err(Error::Structural(StructuralError::EmptySchema))
        ));
        assert!(matches!(
            TableSchema::new(vec![
                ColumnDescription::new("a", ColumnType::String),
                ColumnDescription::new("a", ColumnType::Numeric),
            ]),
            Err(Error::Structural(StructuralError::DuplicateColumn(_)))
        ));
    }

    #[test]
    fn test_column_lookup() {
        let s = TableSchema::new(vec![
            ColumnDescription::new("x", ColumnType::Boolean),
            ColumnDescription::new("y", ColumnType::Time),
        ])
        .unwrap();
        let (idx, col) = s.column_named("y").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(col.column_type, ColumnType::Time);
        assert!(s.column_named("z").is_none());
    }
}
