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

//! On-disk layout of a conglomerate data directory:
//!
//! ```text
//! <dir>/
//!   manifest.json            table list, sequences, admin credential digest
//!   manifest.lock            fs2 exclusive lock while open
//!   tables/<name>/
//!     header.json            schema, current version, row count, segment list
//!     base.rows              compacted committed rows, JSON lines
//!     journal-<v>.seg        one flushed journal per committed version
//! ```
//!
//! Headers and the manifest are replaced via temp-file + atomic rename after
//! fsync, so a crash leaves either the old or the new version visible, never
//! a torn file. Journal segments are written and fsynced *before* the header
//! that references them; a segment on disk that no header mentions is an
//! orphan from an interrupted commit and is ignored at open.

use crate::error::Error;
use crate::schema::ColumnDescription;
use crate::value::Cell;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub(crate) const MANIFEST_FILE: &str = "manifest.json";
pub(crate) const LOCK_FILE: &str = "manifest.lock";
pub(crate) const TABLES_DIR: &str = "tables";
pub(crate) const HEADER_FILE: &str = "header.json";
pub(crate) const BASE_FILE: &str = "base.rows";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub name: String,
    pub tables: Vec<String>,
    /// Last-issued unique-ID per table. A restored value is never reissued.
    pub sequences: BTreeMap<String, u64>,
    pub admin_user: String,
    /// Hex SHA-256 of the admin password.
    pub admin_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SegmentRef {
    pub version: u64,
    pub commit_ts: u64,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableHeader {
    pub table: String,
    pub version: u64,
    /// Valid rows at `version`; checked against replay at open.
    pub row_count: usize,
    /// Every column ever created, in creation order. Rows are stored against
    /// this list; dropped columns stay physical until compaction.
    pub physical_columns: Vec<ColumnDescription>,
    /// Indexes into `physical_columns` forming the current schema version.
    pub projection: Vec<usize>,
    pub segments: Vec<SegmentRef>,
}

/// One committed row in `base.rows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BaseRow {
    pub row: usize,
    pub added: u64,
    pub cells: Vec<Cell>,
}

/// One journal operation in a segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum SegmentRecord {
    Insert { row: usize, cells: Vec<Cell> },
    Delete { row: usize },
    AddColumn { column: ColumnDescription },
    DropColumn { name: String },
}

pub(crate) fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

pub(crate) fn table_dir(dir: &Path, table: &str) -> PathBuf {
    dir.join(TABLES_DIR).join(table)
}

pub(crate) fn header_path(dir: &Path, table: &str) -> PathBuf {
    table_dir(dir, table).join(HEADER_FILE)
}

pub(crate) fn base_path(dir: &Path, table: &str) -> PathBuf {
    table_dir(dir, table).join(BASE_FILE)
}

pub(crate) fn segment_file_name(version: u64) -> String {
    format!("journal-{version}.seg")
}

/// Take the exclusive directory lock. Transactional use and offline repair
/// are mutually exclusive through this lock.
pub(crate) fn lock_dir(dir: &Path) -> Result<File, Error> {
    let f = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    f.try_lock_exclusive().map_err(|_| {
        Error::misuse(format!(
            "data directory {} is locked by another process",
            dir.display()
        ))
    })?;
    Ok(f)
}

fn fsync_dir(dir: &Path) -> Result<(), Error> {
    // Not all platforms support opening a directory for sync; best effort.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

/// Serialize to a temp file, fsync, and atomically rename over the target.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Storage(format!("no parent directory for {}", path.display())))?;
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        let buf =
            serde_json::to_vec_pretty(value).map_err(|e| Error::Storage(e.to_string()))?;
        f.write_all(&buf)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    fsync_dir(parent)?;
    Ok(())
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, Error> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::corruption(path.display().to_string(), e.to_string()))
}

/// Write a whole segment file and fsync it. The header referencing this
/// segment must only be written after this returns.
pub(crate) fn write_segment(path: &Path, records: &[SegmentRecord]) -> Result<(), Error> {
    let mut f = File::create(path)?;
    for rec in records {
        let line = serde_json::to_string(rec).map_err(|e| Error::Storage(e.to_string()))?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
    }
    f.sync_all()?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

pub(crate) fn read_segment(path: &Path) -> Result<Vec<SegmentRecord>, Error> {
    read_lines(path)
}

pub(crate) fn read_base_rows(path: &Path) -> Result<Vec<BaseRow>, Error> {
    if !path.exists() {
        return Ok(vec![]);
    }
    read_lines(path)
}

pub(crate) fn write_base_rows(path: &Path, rows: &[BaseRow]) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        for row in rows {
            let line = serde_json::to_string(row).map_err(|e| Error::Storage(e.to_string()))?;
            f.write_all(line.as_bytes())?;
            f.write_all(b"\n")?;
        }
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, Error> {
    let f = File::open(path)?;
    let reader = BufReader::new(f);
    let mut out = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec = serde_json::from_str(&line).map_err(|e| {
            Error::corruption(
                path.display().to_string(),
                format!("bad record at line {}: {e}", n + 1),
            )
        })?;
        out.push(rec);
    }
    Ok(out)
}

/// The manifest held in memory, rewritten durably on every mutation. Every
/// writer goes through the mutex, so a sequence value is on disk before any
/// caller observes it.
pub(crate) struct ManifestStore {
    path: PathBuf,
    state: Mutex<Manifest>,
}

impl ManifestStore {
    pub fn create(dir: &Path, manifest: Manifest) -> Result<Self, Error> {
        let path = manifest_path(dir);
        write_json_atomic(&path, &manifest)?;
        Ok(Self {
            path,
            state: Mutex::new(manifest),
        })
    }

    pub fn open(dir: &Path) -> Result<Self, Error> {
        let path = manifest_path(dir);
        let manifest: Manifest = read_json(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(manifest),
        })
    }

    pub fn snapshot(&self) -> Manifest {
        self.state.lock().unwrap().clone()
    }

    /// Mutate-and-persist under the lock. The mutation is only visible to
    /// other callers once it is durable.
    pub fn update<R>(&self, f: impl FnOnce(&mut Manifest) -> R) -> Result<R, Error> {
        let mut state = self.state.lock().unwrap();
        let mut next = state.clone();
        let r = f(&mut next);
        write_json_atomic(&self.path, &next)?;
        *state = next;
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    #[test]
    fn test_atomic_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header.json");
        let header = TableHeader {
            table: "t".into(),
            version: 3,
            row_count: 2,
            physical_columns: vec![ColumnDescription::new("a", ColumnType::Numeric)],
            projection: vec![0],
            segments: vec![SegmentRef {
                version: 3,
                commit_ts: 9,
                file: segment_file_name(3),
            }],
        };
        write_json_atomic(&path, &header).unwrap();
        let back: TableHeader = read_json(&path).unwrap();
        assert_eq!(back.version, 3);
        assert_eq!(back.segments[0].commit_ts, 9);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_segment_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal-1.seg");
        let recs = vec![
            SegmentRecord::Insert {
                row: 0,
                cells: vec![Cell::Numeric(1.0), Cell::String("Cash".into())],
            },
            SegmentRecord::Delete { row: 4 },
            SegmentRecord::AddColumn {
                column: ColumnDescription::new("flag", ColumnType::Boolean),
            },
        ];
        write_segment(&path, &recs).unwrap();
        let back = read_segment(&path).unwrap();
        assert_eq!(back.len(), 3);
        assert!(matches!(&back[1], SegmentRecord::Delete { row: 4 }));
    }

    #[test]
    fn test_corrupt_json_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let r: Result<TableHeader, _> = read_json(&path);
        assert!(matches!(r, Err(Error::Corruption { .. })));
    }

    #[test]
    fn test_dir_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _l1 = lock_dir(dir.path()).unwrap();
        assert!(matches!(lock_dir(dir.path()), Err(Error::Misuse(_))));
    }
}
