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

//! An isolated, serializable view over the conglomerate. All reads resolve
//! against the snapshot taken at `begin()` plus this transaction's own
//! pending journal; writes accumulate in per-table journals and become
//! visible to others only at a successful commit.
//!
//! A transaction consumes itself at `commit` or `rollback`. Dropping one
//! without finishing it rolls it back, with a warning.

use crate::error::{Error, StructuralError};
use crate::journal::Journal;
use crate::schema::{ColumnDescription, TableSchema};
use crate::table::{RowIndex, TableStore};
use crate::value::Cell;
use ahash::AHashMap;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::conglomerate::Inner;

/// A table created inside a still-open transaction. It has no durable
/// presence until commit; its rows live in a private store.
pub(crate) struct PendingTable {
    pub schema: TableSchema,
    pub store: TableStore,
    pub journal: Journal,
}

pub struct Transaction {
    inner: Arc<Inner>,
    ts: u64,
    /// Per-table journals against committed tables.
    work: AHashMap<String, Journal>,
    /// Creation order matters at commit; a created table's rows follow it.
    pending_creates: IndexMap<String, PendingTable>,
    pending_drops: Vec<String>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<Inner>, ts: u64) -> Self {
        Self {
            inner,
            ts,
            work: AHashMap::new(),
            pending_creates: IndexMap::new(),
            pending_drops: vec![],
            finished: false,
        }
    }

    /// The snapshot number this transaction reads at.
    pub fn snapshot_ts(&self) -> u64 {
        self.ts
    }

    fn is_dropped(&self, table: &str) -> bool {
        self.pending_drops.iter().any(|t| t == table)
    }

    fn committed_resource(
        &self,
        table: &str,
    ) -> Result<Arc<crate::conglomerate::TableResource>, Error> {
        if self.is_dropped(table) {
            return Err(StructuralError::NoSuchTable(table.to_string()).into());
        }
        self.inner.table(table)
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.pending_creates.contains_key(table)
            || (!self.is_dropped(table) && self.inner.has_table(table))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .committed_table_names()
            .into_iter()
            .filter(|t| !self.is_dropped(t))
            .chain(self.pending_creates.keys().cloned())
            .collect();
        names.sort();
        names
    }

    /// The table's schema as this transaction sees it, including its own
    /// pending column changes.
    pub fn table_schema(&self, table: &str) -> Result<TableSchema, Error> {
        if let Some(pending) = self.pending_creates.get(table) {
            let (phys, proj) =
                effective_columns(pending.schema.columns(), None, Some(&pending.journal));
            return schema_of(&phys, &proj);
        }
        let resource = self.committed_resource(table)?;
        let st = resource.state.read().unwrap();
        let (phys, proj) =
            effective_columns(&st.physical, Some(&st.projection), self.work.get(table));
        schema_of(&phys, &proj)
    }

    /// Register a new table. It exists only for this transaction until
    /// commit; a concurrent commit of the same name is a conflict.
    pub fn create_table(&mut self, table: &str, schema: TableSchema) -> Result<(), Error> {
        if self.pending_creates.contains_key(table) || self.inner.has_table(table) {
            return Err(StructuralError::TableExists(table.to_string()).into());
        }
        self.pending_creates.insert(
            table.to_string(),
            PendingTable {
                schema,
                store: TableStore::new(),
                journal: Journal::new(),
            },
        );
        Ok(())
    }

    /// Remove a table from this transaction's view. A committed table stays
    /// durable until the drop commits; a table created in this transaction
    /// simply vanishes.
    pub fn drop_table(&mut self, table: &str) -> Result<(), Error> {
        if self.pending_creates.shift_remove(table).is_some() {
            return Ok(());
        }
        if self.is_dropped(table) || !self.inner.has_table(table) {
            return Err(StructuralError::NoSuchTable(table.to_string()).into());
        }
        // Pending row work against the table is moot once it's dropped.
        if let Some(journal) = self.work.remove(table)
            && let Ok(resource) = self.inner.table(table)
        {
            let mut st = resource.state.write().unwrap();
            for row in journal.inserted_rows() {
                st.store.discard_uncommitted(row);
            }
        }
        self.pending_drops.push(table.to_string());
        Ok(())
    }

    /// Insert a row, cells in schema-column order. The row is visible only
    /// to this transaction until commit. Returns the allocated row index.
    pub fn insert(&mut self, table: &str, cells: Vec<Cell>) -> Result<RowIndex, Error> {
        let ts = self.ts;
        if let Some(pending) = self.pending_creates.get_mut(table) {
            let (phys, proj) =
                effective_columns(pending.schema.columns(), None, Some(&pending.journal));
            return insert_row(
                &mut pending.store,
                &mut pending.journal,
                &phys,
                &proj,
                table,
                ts,
                cells,
            );
        }
        let resource = self.committed_resource(table)?;
        let journal = self.work.entry(table.to_string()).or_default();
        let mut st = resource.state.write().unwrap();
        let (phys, proj) = effective_columns(&st.physical, Some(&st.projection), Some(journal));
        insert_row(&mut st.store, journal, &phys, &proj, table, ts, cells)
    }

    /// Delete a row visible in this view. Deleting a row another overlapping
    /// transaction also deletes surfaces as a conflict at whichever commit
    /// comes second.
    pub fn delete(&mut self, table: &str, row: RowIndex) -> Result<(), Error> {
        let ts = self.ts;
        if let Some(pending) = self.pending_creates.get_mut(table) {
            if pending.journal.deleted_rows().contains(&row)
                || !pending.store.is_row_valid(row, ts, Some(ts))
            {
                return Err(StructuralError::InvalidRow(row).into());
            }
            pending.journal.record_delete(row);
            return Ok(());
        }
        let resource = self.committed_resource(table)?;
        let journal = self.work.entry(table.to_string()).or_default();
        let st = resource.state.read().unwrap();
        if journal.deleted_rows().contains(&row) || !st.store.is_row_valid(row, ts, Some(ts)) {
            return Err(StructuralError::InvalidRow(row).into());
        }
        journal.record_delete(row);
        Ok(())
    }

    pub fn get_cell(&self, table: &str, row: RowIndex, column: usize) -> Result<Cell, Error> {
        let ts = self.ts;
        if let Some(pending) = self.pending_creates.get(table) {
            let (_, proj) =
                effective_columns(pending.schema.columns(), None, Some(&pending.journal));
            let physical = *proj.get(column).ok_or_else(|| no_such_column(table, column))?;
            if pending.journal.deleted_rows().contains(&row) {
                return Err(StructuralError::InvalidRow(row).into());
            }
            return pending.store.cell_in_view(row, physical, ts, Some(ts));
        }
        let resource = self.committed_resource(table)?;
        let st = resource.state.read().unwrap();
        let journal = self.work.get(table);
        let (_, proj) = effective_columns(&st.physical, Some(&st.projection), journal);
        let physical = *proj.get(column).ok_or_else(|| no_such_column(table, column))?;
        if journal.is_some_and(|j| j.deleted_rows().contains(&row)) {
            return Err(StructuralError::InvalidRow(row).into());
        }
        st.store.cell_in_view(row, physical, ts, Some(ts))
    }

    /// A full row in schema-column order.
    pub fn read_row(&self, table: &str, row: RowIndex) -> Result<Vec<Cell>, Error> {
        let width = self.table_schema(table)?.columns().len();
        (0..width).map(|c| self.get_cell(table, row, c)).collect()
    }

    /// Every row index valid in this transaction's view, ascending. The
    /// result is a fresh enumeration; callers may restart it freely.
    pub fn rows(&self, table: &str) -> Result<Vec<RowIndex>, Error> {
        let ts = self.ts;
        if let Some(pending) = self.pending_creates.get(table) {
            let deleted = pending.journal.deleted_rows();
            return Ok(pending
                .store
                .valid_rows(ts, Some(ts))
                .filter(|r| !deleted.contains(r))
                .collect());
        }
        let resource = self.committed_resource(table)?;
        let st = resource.state.read().unwrap();
        let deleted = self
            .work
            .get(table)
            .map(|j| j.deleted_rows())
            .unwrap_or_default();
        Ok(st
            .store
            .valid_rows(ts, Some(ts))
            .filter(|r| !deleted.contains(r))
            .collect())
    }

    pub fn row_count(&self, table: &str) -> Result<usize, Error> {
        Ok(self.rows(table)?.len())
    }

    /// Add a column to the table's schema. Row storage is untouched; rows
    /// written before the column existed read `Null` in it.
    pub fn add_column(&mut self, table: &str, column: ColumnDescription) -> Result<(), Error> {
        let current = self.table_schema(table)?;
        if current.column_named(&column.name).is_some() {
            return Err(StructuralError::DuplicateColumn(column.name).into());
        }
        if let Some(pending) = self.pending_creates.get_mut(table) {
            pending.journal.record_add_column(column);
            return Ok(());
        }
        self.committed_resource(table)?;
        self.work
            .entry(table.to_string())
            .or_default()
            .record_add_column(column);
        Ok(())
    }

    /// Remove a column from the table's schema. The cells stay physically in
    /// place until compaction; row indexes never change.
    pub fn drop_column(&mut self, table: &str, name: &str) -> Result<(), Error> {
        let current = self.table_schema(table)?;
        if current.column_named(name).is_none() {
            return Err(StructuralError::NoSuchColumn {
                table: table.to_string(),
                column: name.to_string(),
            }
            .into());
        }
        if current.columns().len() == 1 {
            return Err(StructuralError::EmptySchema.into());
        }
        if let Some(pending) = self.pending_creates.get_mut(table) {
            pending.journal.record_drop_column(name);
            return Ok(());
        }
        self.committed_resource(table)?;
        self.work
            .entry(table.to_string())
            .or_default()
            .record_drop_column(name);
        Ok(())
    }

    /// Issue the next unique ID for a table. Durable before return and
    /// *not* transactional: IDs consumed by a rolled-back transaction are
    /// never reissued, so gaps are normal.
    pub fn next_unique_id(&self, table: &str) -> Result<u64, Error> {
        if !self.table_exists(table) {
            return Err(StructuralError::NoSuchTable(table.to_string()).into());
        }
        crate::sequence::next_value(&self.inner.manifest, table)
    }

    /// Validate this transaction's journals against everything committed
    /// since its snapshot, then apply durably. On conflict, nothing is
    /// applied and the transaction is rolled back.
    pub fn commit(mut self) -> Result<(), Error> {
        self.finished = true;
        let work = std::mem::take(&mut self.work);
        let creates = std::mem::take(&mut self.pending_creates);
        let drops = std::mem::take(&mut self.pending_drops);
        self.inner.commit(self.ts, work, creates, drops)
    }

    /// Discard all pending work. Never fails.
    pub fn rollback(mut self) {
        self.finished = true;
        let work = std::mem::take(&mut self.work);
        self.inner.rollback(self.ts, work);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "transaction at snapshot {} dropped without commit or rollback; rolling back",
                self.ts
            );
            let work = std::mem::take(&mut self.work);
            self.inner.rollback(self.ts, work);
        }
    }
}

fn no_such_column(table: &str, column: usize) -> Error {
    StructuralError::NoSuchColumn {
        table: table.to_string(),
        column: format!("#{column}"),
    }
    .into()
}

fn schema_of(physical: &[ColumnDescription], projection: &[usize]) -> Result<TableSchema, Error> {
    TableSchema::new(projection.iter().map(|&i| physical[i].clone()).collect())
}

/// Overlay a journal's schema changes onto a committed column layout.
/// Returns the extended physical column list and the effective projection
/// into it. `projection: None` means the identity projection.
fn effective_columns(
    physical: &[ColumnDescription],
    projection: Option<&[usize]>,
    journal: Option<&Journal>,
) -> (Vec<ColumnDescription>, Vec<usize>) {
    let mut phys = physical.to_vec();
    let mut proj = match projection {
        Some(p) => p.to_vec(),
        None => (0..phys.len()).collect(),
    };
    if let Some(journal) = journal {
        for entry in journal.entries() {
            match entry {
                crate::journal::JournalEntry::AddColumn(column) => {
                    phys.push(column.clone());
                    proj.push(phys.len() - 1);
                }
                crate::journal::JournalEntry::DropColumn(name) => {
                    proj.retain(|&i| phys[i].name != *name);
                }
                _ => {}
            }
        }
    }
    (phys, proj)
}

/// Unique constraints as groups of schema-column positions: each `unique`
/// column alone, and each `unique_group` number as one composite group.
fn unique_groups(physical: &[ColumnDescription], projection: &[usize]) -> Vec<Vec<usize>> {
    let mut composite: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    let mut groups = Vec::new();
    for (pos, &pi) in projection.iter().enumerate() {
        let column = &physical[pi];
        if column.unique_group >= 0 {
            composite.entry(column.unique_group).or_default().push(pos);
        } else if column.unique {
            groups.push(vec![pos]);
        }
    }
    groups.extend(composite.into_values());
    groups
}

fn insert_row(
    store: &mut TableStore,
    journal: &mut Journal,
    physical: &[ColumnDescription],
    projection: &[usize],
    table: &str,
    ts: u64,
    cells: Vec<Cell>,
) -> Result<RowIndex, Error> {
    if cells.len() != projection.len() {
        return Err(StructuralError::Arity {
            expected: projection.len(),
            got: cells.len(),
        }
        .into());
    }
    for (cell, &pi) in cells.iter().zip(projection) {
        cell.conforms_to(&physical[pi])?;
    }

    // Unique enforcement against this transaction's own view. Tuples with a
    // Null member are exempt, per usual SQL semantics.
    let deleted = journal.deleted_rows();
    for group in unique_groups(physical, projection) {
        if group.iter().any(|&pos| cells[pos] == Cell::Null) {
            continue;
        }
        for row in store.valid_rows(ts, Some(ts)) {
            if deleted.contains(&row) {
                continue;
            }
            let same = group.iter().all(|&pos| {
                store
                    .cell_in_view(row, projection[pos], ts, Some(ts))
                    .map(|existing| existing == cells[pos])
                    .unwrap_or(false)
            });
            if same {
                let columns = group
                    .iter()
                    .map(|&pos| physical[projection[pos]].name.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(StructuralError::UniqueViolation {
                    table: table.to_string(),
                    columns,
                }
                .into());
            }
        }
    }

    // Physically align to the full column list; positions outside the
    // projection (dropped columns) hold Null.
    let width = physical.len();
    let mut physical_cells = vec![Cell::Null; width];
    for (pos, cell) in cells.into_iter().enumerate() {
        physical_cells[projection[pos]] = cell;
    }
    let row = store.add_uncommitted(ts, physical_cells);
    journal.record_insert(row);
    Ok(row)
}
