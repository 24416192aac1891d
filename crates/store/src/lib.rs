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

//! Embeddable transactional table storage.
//!
//! A *conglomerate* is a durable collection of tables opened from a data
//! directory. All access goes through serializable transactions: each
//! `begin()` binds an immutable snapshot of every table, writes accumulate
//! in per-table journals, and commit validates against everything committed
//! since the snapshot before durably applying the journal. Losers of a
//! conflict roll back; winners' effects become visible atomically.
//!
//! ```no_run
//! use strata_store::{Cell, ColumnDescription, ColumnType, Conglomerate, TableSchema};
//!
//! let db = Conglomerate::create("data".as_ref(), "mydb", "admin", "secret")?;
//! let mut tx = db.begin();
//! let schema = TableSchema::new(vec![
//!     ColumnDescription::new("number", ColumnType::Numeric),
//!     ColumnDescription::new("name", ColumnType::String),
//! ])?;
//! tx.create_table("Accounts", schema)?;
//! tx.insert("Accounts", vec![Cell::Numeric(105.0), Cell::String("Cash".into())])?;
//! tx.commit()?;
//! # Ok::<(), strata_store::Error>(())
//! ```

mod conglomerate;
mod error;
mod journal;
pub mod repair;
mod results;
mod root_lock;
mod schema;
mod sequence;
mod storage;
mod table;
mod transaction;
mod value;

pub use conglomerate::Conglomerate;
pub use error::{ConflictInfo, ConflictKind, Error, StructuralError};
pub use results::ResultInfo;
pub use root_lock::{RootLockGuard, RootLockRegistry};
pub use schema::{ColumnDescription, ColumnType, TableSchema};
pub use table::{RowIndex, RowState};
pub use transaction::Transaction;
pub use value::Cell;

#[cfg(test)]
mod concurrent_tests;
