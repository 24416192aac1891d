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

//! Reference-counted root locks: "the current row-set of a table as observed
//! by a particular result". While any lock on a table is outstanding, rows
//! made invalid after the locked snapshot are not physically reclaimed.
//!
//! Locks are held through [`RootLockGuard`], whose drop releases exactly
//! once on every exit path. There is no manual unlock call to forget.

use ahash::AHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct RootLockRegistry {
    /// table -> (locked snapshot -> refcount). Counts accumulate; the same
    /// logical handle may lock the same snapshot more than once.
    locks: Mutex<AHashMap<String, BTreeMap<u64, usize>>>,
}

impl RootLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self, table: &str, snapshot: u64) {
        let mut locks = self.locks.lock().unwrap();
        *locks
            .entry(table.to_string())
            .or_default()
            .entry(snapshot)
            .or_insert(0) += 1;
    }

    pub(crate) fn release(&self, table: &str, snapshot: u64) {
        let mut locks = self.locks.lock().unwrap();
        let Some(per_table) = locks.get_mut(table) else {
            debug_assert!(false, "release of unlocked table {table}");
            return;
        };
        match per_table.get_mut(&snapshot) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                per_table.remove(&snapshot);
                if per_table.is_empty() {
                    locks.remove(table);
                }
            }
            None => debug_assert!(false, "release of unlocked snapshot {snapshot} on {table}"),
        }
    }

    /// The oldest snapshot any lock on this table still protects.
    pub fn min_outstanding(&self, table: &str) -> Option<u64> {
        let locks = self.locks.lock().unwrap();
        locks
            .get(table)
            .and_then(|per_table| per_table.keys().next().copied())
    }

    pub fn lock_count(&self, table: &str) -> usize {
        let locks = self.locks.lock().unwrap();
        locks
            .get(table)
            .map(|per_table| per_table.values().sum())
            .unwrap_or(0)
    }
}

/// Scoped ownership of one root lock. Construction acquired; drop releases
/// and then runs the registered sweep callback so newly unprotected rows
/// become reclaimable promptly.
pub struct RootLockGuard {
    registry: Arc<RootLockRegistry>,
    table: String,
    snapshot: u64,
    after_release: Option<Box<dyn FnOnce() + Send>>,
}

impl RootLockGuard {
    pub(crate) fn new(
        registry: Arc<RootLockRegistry>,
        table: &str,
        snapshot: u64,
        after_release: Box<dyn FnOnce() + Send>,
    ) -> Self {
        registry.acquire(table, snapshot);
        Self {
            registry,
            table: table.to_string(),
            snapshot,
            after_release: Some(after_release),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }
}

impl Drop for RootLockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.table, self.snapshot);
        if let Some(sweep) = self.after_release.take() {
            sweep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(registry: &Arc<RootLockRegistry>, table: &str, snapshot: u64) -> RootLockGuard {
        RootLockGuard::new(registry.clone(), table, snapshot, Box::new(|| {}))
    }

    #[test]
    fn test_counts_accumulate_and_release() {
        let reg = Arc::new(RootLockRegistry::new());
        let g1 = guard(&reg, "t", 5);
        let g2 = guard(&reg, "t", 5);
        let g3 = guard(&reg, "t", 9);
        assert_eq!(reg.lock_count("t"), 3);
        assert_eq!(reg.min_outstanding("t"), Some(5));
        drop(g1);
        assert_eq!(reg.lock_count("t"), 2);
        assert_eq!(reg.min_outstanding("t"), Some(5));
        drop(g2);
        assert_eq!(reg.min_outstanding("t"), Some(9));
        drop(g3);
        assert_eq!(reg.lock_count("t"), 0);
        assert_eq!(reg.min_outstanding("t"), None);
    }

    #[test]
    fn test_release_runs_sweep_callback() {
        let reg = Arc::new(RootLockRegistry::new());
        let swept = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let s = swept.clone();
        let g = RootLockGuard::new(
            reg.clone(),
            "t",
            1,
            Box::new(move || s.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        assert!(!swept.load(std::sync::atomic::Ordering::SeqCst));
        drop(g);
        assert!(swept.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(reg.lock_count("t"), 0);
    }
}
