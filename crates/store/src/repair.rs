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

//! Offline structural check and repair of a conglomerate data directory.
//! Takes the same exclusive directory lock as a live open, so repair and
//! transactional use can never overlap.
//!
//! `check` only reports; `fix` additionally quarantines orphan journal
//! segments left by interrupted commits (renamed with an `.orphan` suffix,
//! never deleted), reconciles header row counts against replay, and drops
//! manifest entries whose table directories are gone. `migrate` copies a
//! conglomerate to a fresh directory, sequences included.

use crate::conglomerate::Conglomerate;
use crate::error::{Error, StructuralError};
use crate::storage::{self, Manifest, SegmentRecord, TableHeader};
use crate::table::TableStore;
use std::fs;
use std::path::Path;

/// Receives findings as the walk progresses.
pub trait RepairReporter {
    fn problem(&mut self, area: &str, detail: &str);
    fn repaired(&mut self, area: &str, action: &str);
    fn info(&mut self, _detail: &str) {}
}

/// Prints findings to stdout, for the command-line tool.
#[derive(Default)]
pub struct TerminalReporter;

impl RepairReporter for TerminalReporter {
    fn problem(&mut self, area: &str, detail: &str) {
        println!("PROBLEM  {area}: {detail}");
    }

    fn repaired(&mut self, area: &str, action: &str) {
        println!("REPAIRED {area}: {action}");
    }

    fn info(&mut self, detail: &str) {
        println!("         {detail}");
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    pub problems: usize,
    pub repaired: usize,
}

impl RepairOutcome {
    pub fn is_clean(&self) -> bool {
        self.problems == 0
    }
}

/// Walk the directory and report every structural problem without touching
/// anything.
pub fn check(path: &Path, reporter: &mut dyn RepairReporter) -> Result<RepairOutcome, Error> {
    walk(path, reporter, false)
}

/// Walk the directory and repair what can be repaired.
pub fn fix(path: &Path, reporter: &mut dyn RepairReporter) -> Result<RepairOutcome, Error> {
    walk(path, reporter, true)
}

/// Copy a conglomerate into a fresh directory, leaving quarantined orphans
/// and stale temp files behind. The source stays locked for the duration.
/// The copy is opened once to validate it and to fast-forward every
/// sequence to the source's last-used value, so the copy never reissues an
/// ID the source already handed out.
pub fn migrate(
    src: &Path,
    dest: &Path,
    reporter: &mut dyn RepairReporter,
) -> Result<(), Error> {
    if !storage::manifest_path(src).exists() {
        return Err(StructuralError::NotFound(src.display().to_string()).into());
    }
    if storage::manifest_path(dest).exists() {
        return Err(StructuralError::AlreadyExists(dest.display().to_string()).into());
    }
    let _lock = storage::lock_dir(src)?;
    let manifest: Manifest = storage::read_json(&storage::manifest_path(src))?;

    fs::create_dir_all(dest.join(storage::TABLES_DIR))?;
    storage::write_json_atomic(&storage::manifest_path(dest), &manifest)?;
    for table in &manifest.tables {
        let from = storage::table_dir(src, table);
        let to = storage::table_dir(dest, table);
        fs::create_dir_all(&to)?;
        for entry in fs::read_dir(&from)? {
            let entry = entry?;
            let name = entry.file_name();
            let file = name.to_string_lossy();
            if file.ends_with(".tmp") || file.ends_with(".orphan") {
                continue;
            }
            fs::copy(entry.path(), to.join(&name))?;
        }
        reporter.info(&format!("copied table '{table}'"));
    }

    let db = Conglomerate::open(dest, &manifest.name)?;
    for (table, last) in &manifest.sequences {
        db.fast_forward_unique_id(table, *last)?;
        reporter.info(&format!("sequence for '{table}' carried at {last}"));
    }
    db.close()?;
    Ok(())
}

fn walk(
    path: &Path,
    reporter: &mut dyn RepairReporter,
    repair: bool,
) -> Result<RepairOutcome, Error> {
    if !storage::manifest_path(path).exists() {
        return Err(StructuralError::NotFound(path.display().to_string()).into());
    }
    let _lock = storage::lock_dir(path)?;
    let mut manifest: Manifest = storage::read_json(&storage::manifest_path(path))?;
    let mut outcome = RepairOutcome::default();
    reporter.info(&format!(
        "checking conglomerate '{}' with {} table(s)",
        manifest.name,
        manifest.tables.len()
    ));

    let mut missing_tables = Vec::new();
    for table in &manifest.tables {
        check_table(path, table, reporter, repair, &mut outcome, &mut missing_tables)?;
    }

    if repair && !missing_tables.is_empty() {
        manifest.tables.retain(|t| !missing_tables.contains(t));
        for t in &missing_tables {
            manifest.sequences.remove(t);
        }
        storage::write_json_atomic(&storage::manifest_path(path), &manifest)?;
        for t in &missing_tables {
            reporter.repaired(t, "removed from manifest");
            outcome.repaired += 1;
        }
    }

    // Table directories the manifest does not know about are reported but
    // never removed; they may hold data someone wants back.
    if let Ok(entries) = fs::read_dir(path.join(storage::TABLES_DIR)) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !manifest.tables.contains(&name) && !missing_tables.contains(&name) {
                reporter.problem(&name, "table directory not listed in manifest");
                outcome.problems += 1;
            }
        }
    }

    Ok(outcome)
}

fn check_table(
    path: &Path,
    table: &str,
    reporter: &mut dyn RepairReporter,
    repair: bool,
    outcome: &mut RepairOutcome,
    missing_tables: &mut Vec<String>,
) -> Result<(), Error> {
    let header_path = storage::header_path(path, table);
    if !header_path.exists() {
        reporter.problem(table, "table listed in manifest but header is missing");
        outcome.problems += 1;
        missing_tables.push(table.to_string());
        return Ok(());
    }
    let header: TableHeader = match storage::read_json(&header_path) {
        Ok(h) => h,
        Err(e) => {
            reporter.problem(table, &format!("unreadable header: {e}"));
            outcome.problems += 1;
            return Ok(());
        }
    };

    let dir = storage::table_dir(path, table);
    let mut store = TableStore::new();
    for base_row in storage::read_base_rows(&storage::base_path(path, table))? {
        store.restore_row(base_row.row, base_row.added, base_row.cells);
    }
    let mut replay_ok = true;
    for seg in &header.segments {
        let seg_path = dir.join(&seg.file);
        if !seg_path.exists() {
            reporter.problem(table, &format!("referenced segment {} is missing", seg.file));
            outcome.problems += 1;
            replay_ok = false;
            continue;
        }
        match storage::read_segment(&seg_path) {
            Ok(records) => {
                for rec in records {
                    match rec {
                        SegmentRecord::Insert { row, cells } => {
                            store.restore_row(row, seg.commit_ts, cells)
                        }
                        SegmentRecord::Delete { row } => store.restore_delete(row),
                        SegmentRecord::AddColumn { .. } | SegmentRecord::DropColumn { .. } => {}
                    }
                }
            }
            Err(e) => {
                reporter.problem(table, &format!("unreadable segment {}: {e}", seg.file));
                outcome.problems += 1;
                replay_ok = false;
            }
        }
    }

    if replay_ok {
        let replayed = store.current_row_count();
        if replayed != header.row_count {
            reporter.problem(
                table,
                &format!(
                    "header claims {} row(s), replay yields {replayed}",
                    header.row_count
                ),
            );
            outcome.problems += 1;
            if repair {
                let mut fixed = header.clone();
                fixed.row_count = replayed;
                storage::write_json_atomic(&header_path, &fixed)?;
                reporter.repaired(table, &format!("header row count set to {replayed}"));
                outcome.repaired += 1;
            }
        }
    }

    // Journal segments on disk the header does not reference are leftovers
    // of a commit interrupted before its header rename.
    let referenced: Vec<&str> = header.segments.iter().map(|s| s.file.as_str()).collect();
    if let Ok(entries) = fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let orphan_segment = name.starts_with("journal-")
                && name.ends_with(".seg")
                && !referenced.contains(&name.as_str());
            let stale_tmp = name.ends_with(".tmp");
            if !orphan_segment && !stale_tmp {
                continue;
            }
            let what = if stale_tmp {
                "stale temp file"
            } else {
                "orphan journal segment"
            };
            reporter.problem(table, &format!("{what} {name}"));
            outcome.problems += 1;
            if repair {
                let from = dir.join(&name);
                let to = dir.join(format!("{name}.orphan"));
                fs::rename(&from, &to)?;
                reporter.repaired(table, &format!("{name} quarantined as {name}.orphan"));
                outcome.repaired += 1;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescription, ColumnType, TableSchema};
    use crate::value::Cell;

    #[derive(Default)]
    struct Recording {
        problems: Vec<String>,
    }

    impl RepairReporter for Recording {
        fn problem(&mut self, area: &str, detail: &str) {
            self.problems.push(format!("{area}: {detail}"));
        }
        fn repaired(&mut self, _area: &str, _action: &str) {}
    }

    fn seeded(dir: &Path) {
        let c = Conglomerate::create(dir, "repairtest", "admin", "pw").unwrap();
        let mut tx = c.begin();
        let schema = TableSchema::new(vec![ColumnDescription::new("n", ColumnType::Numeric)])
            .unwrap();
        tx.create_table("t", schema).unwrap();
        tx.insert("t", vec![Cell::Numeric(1.0)]).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_clean_directory_checks_clean() {
        let dir = tempfile::tempdir().unwrap();
        seeded(dir.path());
        let mut rep = Recording::default();
        let outcome = check(dir.path(), &mut rep).unwrap();
        assert!(outcome.is_clean(), "{:?}", rep.problems);
    }

    #[test]
    fn test_orphan_segment_reported_then_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        seeded(dir.path());
        let orphan = storage::table_dir(dir.path(), "t").join("journal-99.seg");
        std::fs::write(&orphan, b"{\"op\":\"delete\",\"row\":0}\n").unwrap();

        let mut rep = Recording::default();
        let outcome = check(dir.path(), &mut rep).unwrap();
        assert_eq!(outcome.problems, 1);
        assert!(rep.problems[0].contains("orphan"));

        let outcome = fix(dir.path(), &mut Recording::default()).unwrap();
        assert_eq!(outcome.repaired, 1);
        assert!(!orphan.exists());
        assert!(orphan.with_extension("seg.orphan").exists());

        // Clean after quarantine, and the store opens normally.
        let outcome = check(dir.path(), &mut Recording::default()).unwrap();
        assert!(outcome.is_clean());
        let c = Conglomerate::open(dir.path(), "repairtest").unwrap();
        let tx = c.begin();
        assert_eq!(tx.row_count("t").unwrap(), 1);
        tx.rollback();
    }

    #[test]
    fn test_row_count_mismatch_repaired() {
        let dir = tempfile::tempdir().unwrap();
        seeded(dir.path());
        let hp = storage::header_path(dir.path(), "t");
        let mut header: TableHeader = storage::read_json(&hp).unwrap();
        header.row_count = 41;
        storage::write_json_atomic(&hp, &header).unwrap();

        assert!(matches!(
            Conglomerate::open(dir.path(), "repairtest"),
            Err(Error::Corruption { .. })
        ));
        let outcome = fix(dir.path(), &mut Recording::default()).unwrap();
        assert_eq!(outcome.problems, 1);
        assert_eq!(outcome.repaired, 1);
        let c = Conglomerate::open(dir.path(), "repairtest").unwrap();
        let tx = c.begin();
        assert_eq!(tx.row_count("t").unwrap(), 1);
        tx.rollback();
    }

    #[test]
    fn test_migrate_copies_tables_and_carries_sequences() {
        let src = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let dest = scratch.path().join("copy");
        {
            let c = Conglomerate::create(src.path(), "repairtest", "admin", "pw").unwrap();
            let mut tx = c.begin();
            let schema =
                TableSchema::new(vec![ColumnDescription::new("n", ColumnType::Numeric)]).unwrap();
            tx.create_table("t", schema).unwrap();
            tx.insert("t", vec![Cell::Numeric(1.0)]).unwrap();
            tx.insert("t", vec![Cell::Numeric(2.0)]).unwrap();
            tx.commit().unwrap();
            for _ in 0..5 {
                c.next_unique_id("t").unwrap();
            }
        }

        migrate(src.path(), &dest, &mut Recording::default()).unwrap();

        let c = Conglomerate::open(&dest, "repairtest").unwrap();
        let tx = c.begin();
        assert_eq!(tx.row_count("t").unwrap(), 2);
        tx.rollback();
        // The copy continues past everything the source handed out.
        assert_eq!(c.next_unique_id("t").unwrap(), 6);
        drop(c);

        // An existing destination is refused.
        assert!(matches!(
            migrate(src.path(), &dest, &mut Recording::default()),
            Err(Error::Structural(StructuralError::AlreadyExists(_)))
        ));
    }

    #[test]
    fn test_missing_table_dir_dropped_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        seeded(dir.path());
        std::fs::remove_dir_all(storage::table_dir(dir.path(), "t")).unwrap();
        let outcome = fix(dir.path(), &mut Recording::default()).unwrap();
        assert_eq!(outcome.problems, 1);
        let c = Conglomerate::open(dir.path(), "repairtest").unwrap();
        assert!(c.table_names().is_empty());
    }
}
