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

//! The closed error taxonomy of the storage core. The session boundary maps
//! these kinds onto wire codes; the core only exposes the kind.

use crate::schema::ColumnType;

/// Where and why a commit-time conflict was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub table: String,
    pub row_index: Option<usize>,
    pub kind: ConflictKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// A concurrently-committed transaction wrote an overlapping row.
    OverlappingWrite,
    /// A concurrently-committed transaction changed the table's schema, or
    /// this transaction's schema change raced any write to the table.
    SchemaChange,
    /// A concurrently-committed transaction created or dropped the table.
    TableExistence,
}

impl std::fmt::Display for ConflictInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ConflictKind::OverlappingWrite => match self.row_index {
                Some(row) => write!(f, "overlapping write on row {} of '{}'", row, self.table),
                None => write!(f, "overlapping write on '{}'", self.table),
            },
            ConflictKind::SchemaChange => {
                write!(f, "concurrent schema change on '{}'", self.table)
            }
            ConflictKind::TableExistence => {
                write!(f, "concurrent create/drop of '{}'", self.table)
            }
        }
    }
}

/// Programming/usage errors surfaced immediately to the caller. Never
/// retried automatically.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StructuralError {
    #[error("conglomerate already exists: {0}")]
    AlreadyExists(String),
    #[error("conglomerate not found: {0}")]
    NotFound(String),
    #[error("no such table: {0}")]
    NoSuchTable(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("no such column '{column}' in table '{table}'")]
    NoSuchColumn { table: String, column: String },
    #[error("duplicate column: {0}")]
    DuplicateColumn(String),
    #[error("table schema has no columns")]
    EmptySchema,
    #[error("row {0} is not valid in this view")]
    InvalidRow(usize),
    #[error("range [{start}, {start}+{count}) out of bounds for {row_count} rows")]
    OutOfRange {
        start: usize,
        count: usize,
        row_count: usize,
    },
    #[error("wrong number of cells: expected {expected}, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("type mismatch for column '{column}': expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        got: String,
    },
    #[error("null value for not-null column '{column}'")]
    NullViolation { column: String },
    #[error("value for column '{column}' exceeds declared size {size}")]
    SizeExceeded { column: String, size: usize },
    #[error("unique constraint violated on column(s) {columns} of '{table}'")]
    UniqueViolation { table: String, columns: String },
    #[error("sequence for '{table}' cannot move backward ({current} -> {requested})")]
    SequenceRegression {
        table: String,
        current: u64,
        requested: u64,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Raised only at commit; the transaction is left rolled back. Recovery
    /// is a fresh `begin()` by the caller, never an automatic retry here.
    #[error("transaction conflict: {0}")]
    Conflict(ConflictInfo),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    /// Structural damage detected in the on-disk layout. Repair is manual
    /// and offline, through `repair::fix`.
    #[error("corruption in '{location}': {detail}")]
    Corruption { location: String, detail: String },
    /// Caller bug: double-dispose, use of a terminated handle, reads without
    /// a held root lock. Not a transient condition.
    #[error("resource lifecycle misuse: {0}")]
    Misuse(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl Error {
    pub fn corruption(location: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Corruption {
            location: location.into(),
            detail: detail.into(),
        }
    }

    pub fn misuse(detail: impl Into<String>) -> Self {
        Error::Misuse(detail.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
