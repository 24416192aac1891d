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

//! The per-table, per-transaction log of pending operations: an immutable,
//! append-only sequence of typed entries, consumed exactly once: applied as
//! a set at commit or discarded as a set at rollback. Partial application is
//! never observable.

use crate::schema::ColumnDescription;
use crate::table::RowIndex;
use ahash::AHashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// The row's cells already sit uncommitted in the table store; the
    /// journal records the index only.
    Insert(RowIndex),
    Delete(RowIndex),
    AddColumn(ColumnDescription),
    DropColumn(String),
}

#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_insert(&mut self, row: RowIndex) {
        self.entries.push(JournalEntry::Insert(row));
    }

    pub fn record_delete(&mut self, row: RowIndex) {
        self.entries.push(JournalEntry::Delete(row));
    }

    pub fn record_add_column(&mut self, column: ColumnDescription) {
        self.entries.push(JournalEntry::AddColumn(column));
    }

    pub fn record_drop_column(&mut self, name: &str) {
        self.entries.push(JournalEntry::DropColumn(name.to_string()));
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<JournalEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_schema_change(&self) -> bool {
        self.entries.iter().any(|e| {
            matches!(
                e,
                JournalEntry::AddColumn(_) | JournalEntry::DropColumn(_)
            )
        })
    }

    /// The set of row indexes this journal writes. Commit-time conflict
    /// checking intersects these sets across concurrently-committed
    /// journals; read-only access never appears here.
    pub fn written_rows(&self) -> AHashSet<RowIndex> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Insert(row) | JournalEntry::Delete(row) => Some(*row),
                _ => None,
            })
            .collect()
    }

    /// Rows this journal deletes, the only writes that can overlap another
    /// transaction's view (inserts always land in distinct slots).
    pub fn deleted_rows(&self) -> AHashSet<RowIndex> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Delete(row) => Some(*row),
                _ => None,
            })
            .collect()
    }

    /// Rows inserted by this journal, for rollback slot reclamation.
    pub fn inserted_rows(&self) -> Vec<RowIndex> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Insert(row) => Some(*row),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_order_preserved() {
        let mut j = Journal::new();
        j.record_insert(3);
        j.record_delete(1);
        j.record_insert(4);
        assert_eq!(
            j.entries(),
            &[
                JournalEntry::Insert(3),
                JournalEntry::Delete(1),
                JournalEntry::Insert(4)
            ]
        );
        assert_eq!(j.written_rows(), [3, 1, 4].into_iter().collect());
        assert_eq!(j.deleted_rows(), [1].into_iter().collect());
        assert_eq!(j.inserted_rows(), vec![3, 4]);
        assert!(!j.has_schema_change());
    }

    #[test]
    fn test_schema_entries_flagged() {
        use crate::schema::{ColumnDescription, ColumnType};
        let mut j = Journal::new();
        j.record_add_column(ColumnDescription::new("extra", ColumnType::Boolean));
        assert!(j.has_schema_change());
        assert!(j.written_rows().is_empty());
    }
}
