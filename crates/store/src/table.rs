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

//! Per-table physical row storage: a sparse array of row slots with a
//! validity marker per slot. Owns no transaction knowledge; visibility is
//! decided from commit timestamps stamped onto slots at journal-apply time.

use crate::error::Error;
use crate::value::Cell;

pub type RowIndex = usize;

/// Externally observable validity of a row slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RowState {
    /// Free; the slot may be handed out by `add_uncommitted`.
    Reclaimable,
    /// Written by a transaction that has not committed yet.
    Uncommitted,
    /// Committed and reachable by scans.
    Valid,
    /// Removed by a committed transaction, but an older view may still
    /// reference it; reclamation is deferred.
    DeletedPending,
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Vacant,
    Uncommitted {
        tx: u64,
        cells: Vec<Cell>,
    },
    Valid {
        added: u64,
        cells: Vec<Cell>,
    },
    DeletedPending {
        added: u64,
        deleted: u64,
        cells: Vec<Cell>,
    },
}

#[derive(Debug, Default)]
pub struct TableStore {
    slots: Vec<Slot>,
    /// Reclaimable slot indexes, kept sorted descending so `pop` hands out
    /// the lowest index first.
    free: Vec<RowIndex>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn state_of(&self, row: RowIndex) -> RowState {
        match self.slots.get(row) {
            None | Some(Slot::Vacant) => RowState::Reclaimable,
            Some(Slot::Uncommitted { .. }) => RowState::Uncommitted,
            Some(Slot::Valid { .. }) => RowState::Valid,
            Some(Slot::DeletedPending { .. }) => RowState::DeletedPending,
        }
    }

    /// Is the row reachable from the view `(snapshot, tx)`? A transaction
    /// sees committed rows stamped at or before its snapshot, plus its own
    /// uncommitted writes. Journal-pending deletes are filtered above.
    pub fn is_row_valid(&self, row: RowIndex, snapshot: u64, tx: Option<u64>) -> bool {
        match self.slots.get(row) {
            Some(Slot::Uncommitted { tx: owner, .. }) => tx == Some(*owner),
            Some(Slot::Valid { added, .. }) => *added <= snapshot,
            Some(Slot::DeletedPending { added, deleted, .. }) => {
                *added <= snapshot && snapshot < *deleted
            }
            _ => false,
        }
    }

    /// Append to the first reclaimable slot or extend storage. The journal
    /// entry is recorded by the owning transaction, not here.
    pub fn add_uncommitted(&mut self, tx: u64, cells: Vec<Cell>) -> RowIndex {
        if let Some(row) = self.free.pop() {
            self.slots[row] = Slot::Uncommitted { tx, cells };
            row
        } else {
            self.slots.push(Slot::Uncommitted { tx, cells });
            self.slots.len() - 1
        }
    }

    /// Journal-apply: `Uncommitted -> Valid`, stamped with the commit
    /// timestamp.
    pub fn promote(&mut self, row: RowIndex, commit_ts: u64) -> Result<(), Error> {
        match self.slots.get_mut(row) {
            Some(slot @ Slot::Uncommitted { .. }) => {
                let Slot::Uncommitted { cells, .. } = std::mem::replace(slot, Slot::Vacant) else {
                    unreachable!()
                };
                self.slots[row] = Slot::Valid {
                    added: commit_ts,
                    cells,
                };
                Ok(())
            }
            _ => Err(Error::misuse(format!(
                "promote of non-uncommitted row {row}"
            ))),
        }
    }

    /// Rollback: return an uncommitted slot to the free pool.
    pub fn discard_uncommitted(&mut self, row: RowIndex) {
        if matches!(self.slots.get(row), Some(Slot::Uncommitted { .. })) {
            self.slots[row] = Slot::Vacant;
            self.free.push(row);
            self.free.sort_unstable_by(|a, b| b.cmp(a));
        }
    }

    /// Journal-apply: `Valid -> DeletedPending`. The row only becomes
    /// reclaimable once no outstanding view predates the deletion.
    pub fn mark_deleted(&mut self, row: RowIndex, commit_ts: u64) -> Result<(), Error> {
        match self.slots.get_mut(row) {
            Some(slot @ Slot::Valid { .. }) => {
                let Slot::Valid { added, cells } = std::mem::replace(slot, Slot::Vacant) else {
                    unreachable!()
                };
                self.slots[row] = Slot::DeletedPending {
                    added,
                    deleted: commit_ts,
                    cells,
                };
                Ok(())
            }
            _ => Err(Error::misuse(format!("delete of non-valid row {row}"))),
        }
    }

    /// Reclaim every deleted-pending row whose deletion is at or before the
    /// minimum outstanding snapshot. Returns the number of slots freed.
    /// Invariant: a row index is never reused while any root lock on a view
    /// containing it is outstanding; the caller derives `min_outstanding`
    /// from the root lock registry and the live transaction set.
    pub fn sweep(&mut self, min_outstanding: u64) -> usize {
        let mut freed = 0;
        for (row, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::DeletedPending { deleted, .. } = slot
                && *deleted <= min_outstanding
            {
                *slot = Slot::Vacant;
                self.free.push(row);
                freed += 1;
            }
        }
        if freed > 0 {
            self.free.sort_unstable_by(|a, b| b.cmp(a));
        }
        freed
    }

    /// Read a cell through a transactional view. Fails with `InvalidRow` if
    /// the row is not valid as of the caller's view. Columns added after the
    /// row was written read as `Null`.
    pub fn cell_in_view(
        &self,
        row: RowIndex,
        physical_column: usize,
        snapshot: u64,
        tx: Option<u64>,
    ) -> Result<Cell, Error> {
        if !self.is_row_valid(row, snapshot, tx) {
            return Err(crate::error::StructuralError::InvalidRow(row).into());
        }
        Ok(self.cell_unchecked(row, physical_column))
    }

    /// Read a cell through a held root lock. The lock guarantees the slot has
    /// not been reclaimed; anything else here is a caller bug.
    pub fn cell_locked(&self, row: RowIndex, physical_column: usize) -> Result<Cell, Error> {
        match self.slots.get(row) {
            Some(Slot::Valid { .. } | Slot::DeletedPending { .. }) => {
                Ok(self.cell_unchecked(row, physical_column))
            }
            _ => Err(Error::misuse(format!(
                "locked read of reclaimed row {row}"
            ))),
        }
    }

    fn cell_unchecked(&self, row: RowIndex, physical_column: usize) -> Cell {
        let cells = match &self.slots[row] {
            Slot::Uncommitted { cells, .. }
            | Slot::Valid { cells, .. }
            | Slot::DeletedPending { cells, .. } => cells,
            Slot::Vacant => return Cell::Null,
        };
        cells.get(physical_column).cloned().unwrap_or(Cell::Null)
    }

    pub(crate) fn cells_of(&self, row: RowIndex) -> Option<&[Cell]> {
        match self.slots.get(row) {
            Some(
                Slot::Uncommitted { cells, .. }
                | Slot::Valid { cells, .. }
                | Slot::DeletedPending { cells, .. },
            ) => Some(cells),
            _ => None,
        }
    }

    pub(crate) fn added_ts_of(&self, row: RowIndex) -> Option<u64> {
        match self.slots.get(row) {
            Some(Slot::Valid { added, .. } | Slot::DeletedPending { added, .. }) => Some(*added),
            _ => None,
        }
    }

    /// A fresh, restartable enumeration of the rows valid in the given view,
    /// in ascending row-index order.
    pub fn valid_rows<'a>(
        &'a self,
        snapshot: u64,
        tx: Option<u64>,
    ) -> impl Iterator<Item = RowIndex> + 'a {
        (0..self.slots.len()).filter(move |&row| self.is_row_valid(row, snapshot, tx))
    }

    pub fn valid_row_count(&self, snapshot: u64) -> usize {
        self.valid_rows(snapshot, None).count()
    }

    /// Count of rows valid at the latest committed version.
    pub fn current_row_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Valid { .. }))
            .count()
    }

    /// Place a committed row at a specific index during replay/open. Holes
    /// are left vacant; call `rebuild_free_list` once replay completes.
    pub(crate) fn restore_row(&mut self, row: RowIndex, added: u64, cells: Vec<Cell>) {
        if self.slots.len() <= row {
            self.slots.resize(row + 1, Slot::Vacant);
        }
        self.slots[row] = Slot::Valid { added, cells };
    }

    /// Replay of a committed delete. Restart drops all root locks, so the
    /// row goes straight back to the free pool.
    pub(crate) fn restore_delete(&mut self, row: RowIndex) {
        if row < self.slots.len() {
            self.slots[row] = Slot::Vacant;
        }
    }

    pub(crate) fn rebuild_free_list(&mut self) {
        self.free = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| matches!(s, Slot::Vacant).then_some(i))
            .collect();
        self.free.sort_unstable_by(|a, b| b.cmp(a));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(vals: &[f64]) -> Vec<Cell> {
        vals.iter().map(|v| Cell::Numeric(*v)).collect()
    }

    #[test]
    fn test_add_promote_visibility() {
        let mut t = TableStore::new();
        let r = t.add_uncommitted(5, row(&[1.0]));
        // Owner sees it, nobody else does.
        assert!(t.is_row_valid(r, 5, Some(5)));
        assert!(!t.is_row_valid(r, 10, None));
        t.promote(r, 7).unwrap();
        assert!(t.is_row_valid(r, 7, None));
        assert!(!t.is_row_valid(r, 6, None));
        assert_eq!(t.cell_in_view(r, 0, 7, None).unwrap(), Cell::Numeric(1.0));
    }

    #[test]
    fn test_deleted_pending_then_sweep() {
        let mut t = TableStore::new();
        let r = t.add_uncommitted(1, row(&[2.0]));
        t.promote(r, 2).unwrap();
        t.mark_deleted(r, 8).unwrap();
        assert_eq!(t.state_of(r), RowState::DeletedPending);
        // A view older than the deletion still reads the row.
        assert!(t.is_row_valid(r, 5, None));
        assert!(!t.is_row_valid(r, 8, None));
        // An outstanding snapshot at 5 blocks reclamation.
        assert_eq!(t.sweep(5), 0);
        assert_eq!(t.state_of(r), RowState::DeletedPending);
        assert_eq!(t.sweep(8), 1);
        assert_eq!(t.state_of(r), RowState::Reclaimable);
        // The slot is reusable now.
        let r2 = t.add_uncommitted(9, row(&[3.0]));
        assert_eq!(r2, r);
    }

    #[test]
    fn test_reuse_hands_out_lowest_index_first() {
        let mut t = TableStore::new();
        for i in 0..4 {
            let r = t.add_uncommitted(1, row(&[i as f64]));
            t.promote(r, 2).unwrap();
        }
        // Freed out of order; reuse still starts at the lowest index.
        t.mark_deleted(2, 3).unwrap();
        t.mark_deleted(0, 3).unwrap();
        assert_eq!(t.sweep(5), 2);
        assert_eq!(t.add_uncommitted(6, row(&[9.0])), 0);
        assert_eq!(t.add_uncommitted(6, row(&[9.0])), 2);
    }

    #[test]
    fn test_enumeration_is_restartable() {
        let mut t = TableStore::new();
        for i in 0..4 {
            let r = t.add_uncommitted(1, row(&[i as f64]));
            t.promote(r, 2).unwrap();
        }
        t.mark_deleted(1, 3).unwrap();
        let first: Vec<_> = t.valid_rows(10, None).collect();
        let second: Vec<_> = t.valid_rows(10, None).collect();
        assert_eq!(first, vec![0, 2, 3]);
        assert_eq!(first, second);
        // An older view still enumerates the deleted row.
        let old: Vec<_> = t.valid_rows(2, None).collect();
        assert_eq!(old, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_missing_trailing_columns_read_null() {
        let mut t = TableStore::new();
        let r = t.add_uncommitted(1, row(&[1.0]));
        t.promote(r, 1).unwrap();
        assert_eq!(t.cell_in_view(r, 3, 1, None).unwrap(), Cell::Null);
    }

    #[test]
    fn test_locked_read_of_reclaimed_row_is_misuse() {
        let mut t = TableStore::new();
        let r = t.add_uncommitted(1, row(&[1.0]));
        t.promote(r, 1).unwrap();
        t.mark_deleted(r, 2).unwrap();
        assert!(t.cell_locked(r, 0).is_ok());
        t.sweep(u64::MAX);
        assert!(matches!(t.cell_locked(r, 0), Err(Error::Misuse(_))));
    }
}
