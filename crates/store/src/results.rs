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

//! Published result sets: a frozen row map over a table's rows at one
//! snapshot, paged through by range, alive until explicitly disposed.
//!
//! A result holds a root lock on its table for its whole lifetime, so the
//! rows behind the row map cannot be physically reclaimed while a client is
//! still paging, even if the rows are deleted, or the whole table dropped,
//! by later transactions. Publication order is fixed: lock the roots, build
//! the row map, probe the first row, and only then hand out the ID. A
//! handle that reaches the caller is always readable.

use crate::conglomerate::{Conglomerate, TableResource};
use crate::error::{Error, StructuralError};
use crate::root_lock::RootLockGuard;
use crate::schema::ColumnDescription;
use crate::table::RowIndex;
use crate::value::Cell;
use ahash::AHashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// What a client needs to start paging a published result.
#[derive(Debug, Clone)]
pub struct ResultInfo {
    pub id: Uuid,
    pub query: String,
    pub columns: Vec<ColumnDescription>,
    pub row_count: usize,
}

impl ResultInfo {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

struct ResultHandle {
    info: ResultInfo,
    /// Physical column indexes captured at publish; later schema changes to
    /// the table do not affect an already-published result.
    projection: Vec<usize>,
    row_map: Vec<RowIndex>,
    table: Arc<TableResource>,
    _lock: RootLockGuard,
}

#[derive(Default)]
pub(crate) struct ResultCache {
    handles: Mutex<AHashMap<Uuid, ResultHandle>>,
}

impl ResultCache {
    pub(crate) fn open_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

impl Conglomerate {
    /// Publish the current committed rows of a table as a paged result.
    pub fn publish_result(&self, table: &str, query: &str) -> Result<ResultInfo, Error> {
        let resource = self.inner.table(table)?;
        // Lock before scanning: from here no row visible at `snapshot` can
        // be reclaimed until the handle is disposed.
        let (snapshot, lock) = self.inner.locked_snapshot(&resource);

        let (columns, projection, row_map) = {
            let st = resource.state.read().unwrap();
            let columns: Vec<ColumnDescription> = st
                .projection
                .iter()
                .map(|&i| st.physical[i].clone())
                .collect();
            let projection = st.projection.clone();
            let row_map: Vec<RowIndex> = st.store.valid_rows(snapshot, None).collect();

            // Probe the first row; a failure here surfaces to the caller
            // instead of poisoning a published handle.
            if let Some(&first) = row_map.first() {
                for &pi in &projection {
                    st.store.cell_in_view(first, pi, snapshot, None)?;
                }
            }
            (columns, projection, row_map)
        };

        let info = ResultInfo {
            id: Uuid::new_v4(),
            query: query.to_string(),
            columns,
            row_count: row_map.len(),
        };
        debug!(
            "published result {} over '{table}' ({} rows at snapshot {snapshot})",
            info.id, info.row_count
        );
        self.inner.results.handles.lock().unwrap().insert(
            info.id,
            ResultHandle {
                info: info.clone(),
                projection,
                row_map,
                table: resource,
                _lock: lock,
            },
        );
        Ok(info)
    }

    /// Read rows `[start, start + count)` of a published result, in the
    /// result's frozen order. The whole range must be in bounds.
    pub fn result_part(
        &self,
        id: Uuid,
        start: usize,
        count: usize,
    ) -> Result<Vec<Vec<Cell>>, Error> {
        let handles = self.inner.results.handles.lock().unwrap();
        let handle = handles
            .get(&id)
            .ok_or_else(|| Error::misuse(format!("result {id} is unknown or disposed")))?;
        if start.saturating_add(count) > handle.row_map.len() {
            return Err(StructuralError::OutOfRange {
                start,
                count,
                row_count: handle.row_map.len(),
            }
            .into());
        }
        let st = handle.table.state.read().unwrap();
        let mut out = Vec::with_capacity(count);
        for &row in &handle.row_map[start..start + count] {
            let cells = handle
                .projection
                .iter()
                .map(|&pi| st.store.cell_locked(row, pi))
                .collect::<Result<Vec<Cell>, Error>>()?;
            out.push(cells);
        }
        Ok(out)
    }

    pub fn result_info(&self, id: Uuid) -> Result<ResultInfo, Error> {
        self.inner
            .results
            .handles
            .lock()
            .unwrap()
            .get(&id)
            .map(|h| h.info.clone())
            .ok_or_else(|| Error::misuse(format!("result {id} is unknown or disposed")))
    }

    /// Release a published result and its root lock. Disposing twice, or
    /// disposing an ID that never existed, is a caller bug.
    pub fn dispose_result(&self, id: Uuid) -> Result<(), Error> {
        let removed = self.inner.results.handles.lock().unwrap().remove(&id);
        match removed {
            Some(_) => {
                debug!("disposed result {id}");
                Ok(())
            }
            None => Err(Error::misuse(format!(
                "dispose of unknown or already-disposed result {id}"
            ))),
        }
    }

    /// Number of published results not yet disposed.
    pub fn open_results(&self) -> usize {
        self.inner.results.open_count()
    }
}
