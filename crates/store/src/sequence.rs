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

//! Per-table unique-ID sequences. Strictly increasing and durable before
//! any caller observes a value, so a value handed out is never reissued
//! even across a crash. Deliberately outside transactional scope: rollback
//! does not return IDs, so gaps are normal.

use crate::conglomerate::Conglomerate;
use crate::error::{Error, StructuralError};
use crate::storage::ManifestStore;

/// Issue the next value for `table`, persisting the manifest before
/// returning it.
pub(crate) fn next_value(manifest: &ManifestStore, table: &str) -> Result<u64, Error> {
    manifest.update(|m| {
        let v = m.sequences.entry(table.to_string()).or_insert(0);
        *v += 1;
        *v
    })
}

impl Conglomerate {
    /// The next unique ID for a table, outside any transaction.
    pub fn next_unique_id(&self, table: &str) -> Result<u64, Error> {
        if !self.inner.has_table(table) {
            return Err(StructuralError::NoSuchTable(table.to_string()).into());
        }
        next_value(&self.inner.manifest, table)
    }

    /// The last value issued for a table, if any.
    pub fn last_unique_id(&self, table: &str) -> Option<u64> {
        self.inner.manifest.snapshot().sequences.get(table).copied()
    }

    /// Jump a sequence forward, e.g. after importing rows that carry IDs.
    /// Moving backward is refused: it would allow reissuing a value.
    pub fn fast_forward_unique_id(&self, table: &str, to: u64) -> Result<(), Error> {
        if !self.inner.has_table(table) {
            return Err(StructuralError::NoSuchTable(table.to_string()).into());
        }
        self.inner.manifest.update(|m| {
            let current = m.sequences.get(table).copied().unwrap_or(0);
            if to < current {
                return Err(StructuralError::SequenceRegression {
                    table: table.to_string(),
                    current,
                    requested: to,
                });
            }
            m.sequences.insert(table.to_string(), to);
            Ok(())
        })??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Manifest;
    use std::collections::BTreeMap;

    fn store(dir: &std::path::Path) -> ManifestStore {
        ManifestStore::create(
            dir,
            Manifest {
                name: "seqtest".into(),
                tables: vec!["UniqNum".into()],
                sequences: BTreeMap::new(),
                admin_user: "admin".into(),
                admin_digest: String::new(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_values_strictly_increase_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let m = store(dir.path());
        assert_eq!(next_value(&m, "UniqNum").unwrap(), 1);
        assert_eq!(next_value(&m, "UniqNum").unwrap(), 2);
        assert_eq!(next_value(&m, "UniqNum").unwrap(), 3);

        // A reopened manifest continues past everything it handed out.
        let reopened = ManifestStore::open(dir.path()).unwrap();
        assert_eq!(next_value(&reopened, "UniqNum").unwrap(), 4);
    }

    #[test]
    fn test_independent_per_table() {
        let dir = tempfile::tempdir().unwrap();
        let m = store(dir.path());
        assert_eq!(next_value(&m, "a").unwrap(), 1);
        assert_eq!(next_value(&m, "b").unwrap(), 1);
        assert_eq!(next_value(&m, "a").unwrap(), 2);
    }
}
