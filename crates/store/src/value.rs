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

use crate::error::{Error, StructuralError};
use crate::schema::{ColumnDescription, ColumnType};
use serde::{Deserialize, Serialize};

/// A single cell value. One variant per logical column type, plus `Null`.
/// Wire-format encoding and casting are the concern of the client layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Null,
    String(String),
    Numeric(f64),
    /// Milliseconds since the UNIX epoch.
    Time(i64),
    Binary(Vec<u8>),
    Boolean(bool),
    /// An opaque serialized object, stored as-is.
    Object(Vec<u8>),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Cell::Null => None,
            Cell::String(_) => Some(ColumnType::String),
            Cell::Numeric(_) => Some(ColumnType::Numeric),
            Cell::Time(_) => Some(ColumnType::Time),
            Cell::Binary(_) => Some(ColumnType::Binary),
            Cell::Boolean(_) => Some(ColumnType::Boolean),
            Cell::Object(_) => Some(ColumnType::Object),
        }
    }

    /// Validate this cell against a column description: null admissibility,
    /// type agreement, and declared size.
    pub fn conforms_to(&self, column: &ColumnDescription) -> Result<(), Error> {
        match self.column_type() {
            None => {
                if column.not_null {
                    return Err(StructuralError::NullViolation {
                        column: column.name.clone(),
                    }
                    .into());
                }
            }
            Some(t) => {
                if t != column.column_type {
                    return Err(StructuralError::TypeMismatch {
                        column: column.name.clone(),
                        expected: column.column_type,
                        got: t.to_string(),
                    }
                    .into());
                }
                if let Some(size) = column.size
                    && self.width() > size
                {
                    return Err(StructuralError::SizeExceeded {
                        column: column.name.clone(),
                        size,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn width(&self) -> usize {
        match self {
            Cell::String(s) => s.chars().count(),
            Cell::Binary(b) | Cell::Object(b) => b.len(),
            _ => 0,
        }
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Null => f.write_str("NULL"),
            Cell::String(s) => write!(f, "'{s}'"),
            Cell::Numeric(n) => write!(f, "{n}"),
            Cell::Time(t) => write!(f, "TIME({t})"),
            Cell::Binary(b) => write!(f, "BINARY[{}]", b.len()),
            Cell::Boolean(b) => write!(f, "{b}"),
            Cell::Object(o) => write!(f, "OBJECT[{}]", o.len()),
        }
    }
}
