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

//! Multi-threaded behavior: unique-ID issuance, insert throughput without
//! false conflicts, and exactly-one-winner semantics for contended deletes.

use crate::error::Error;
use crate::schema::{ColumnDescription, ColumnType, TableSchema};
use crate::value::Cell;
use crate::Conglomerate;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

fn db_with_table(dir: &std::path::Path) -> Conglomerate {
    let db = Conglomerate::create(dir, "concurrent", "admin", "pw").unwrap();
    let mut tx = db.begin();
    tx.create_table(
        "t",
        TableSchema::new(vec![ColumnDescription::new("n", ColumnType::Numeric)]).unwrap(),
    )
    .unwrap();
    tx.commit().unwrap();
    db
}

#[test]
fn test_unique_ids_distinct_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_with_table(dir.path());

    let mut handles = vec![];
    for _ in 0..2 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            let mut got = Vec::with_capacity(1000);
            for _ in 0..1000 {
                got.push(db.next_unique_id("t").unwrap());
            }
            got
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    let distinct: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(distinct.len(), 2000);
    assert_eq!(all.iter().max(), Some(&2000));
    assert_eq!(db.last_unique_id("t"), Some(2000));
}

#[test]
fn test_concurrent_inserts_never_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_with_table(dir.path());

    let threads = 8;
    let per_thread = 25;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = vec![];
    for t in 0..threads {
        let db = db.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..per_thread {
                let mut tx = db.begin();
                tx.insert("t", vec![Cell::Numeric((t * per_thread + i) as f64)])
                    .unwrap();
                tx.commit().unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let tx = db.begin();
    assert_eq!(tx.row_count("t").unwrap(), threads * per_thread);
    tx.rollback();
}

#[test]
fn test_contended_delete_has_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_with_table(dir.path());
    let row = {
        let mut tx = db.begin();
        let row = tx.insert("t", vec![Cell::Numeric(1.0)]).unwrap();
        tx.commit().unwrap();
        row
    };

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = vec![];
    for _ in 0..threads {
        let db = db.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let mut tx = db.begin();
            tx.delete("t", row).unwrap();
            barrier.wait();
            tx.commit()
        }));
    }
    let mut wins = 0;
    for h in handles {
        match h.join().unwrap() {
            Ok(()) => wins += 1,
            Err(Error::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(wins, 1);

    let tx = db.begin();
    assert_eq!(tx.row_count("t").unwrap(), 0);
    tx.rollback();
}

#[test]
fn test_multi_table_commit_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = Conglomerate::create(dir.path(), "concurrent", "admin", "pw").unwrap();
    let mut tx = db.begin();
    for name in ["a", "b"] {
        tx.create_table(
            name,
            TableSchema::new(vec![ColumnDescription::new("n", ColumnType::Numeric)]).unwrap(),
        )
        .unwrap();
    }
    tx.commit().unwrap();

    // Every commit grows both tables by one row. Any snapshot taken while
    // the writer runs must therefore count them equal.
    let writer_db = db.clone();
    let writer = thread::spawn(move || {
        for i in 0..200 {
            let mut tx = writer_db.begin();
            tx.insert("a", vec![Cell::Numeric(i as f64)]).unwrap();
            tx.insert("b", vec![Cell::Numeric(i as f64)]).unwrap();
            tx.commit().unwrap();
        }
    });
    while !writer.is_finished() {
        let tx = db.begin();
        let a = tx.row_count("a").unwrap();
        let b = tx.row_count("b").unwrap();
        tx.rollback();
        assert_eq!(a, b, "snapshot saw a half-applied commit");
    }
    writer.join().unwrap();

    let tx = db.begin();
    assert_eq!(tx.row_count("a").unwrap(), 200);
    assert_eq!(tx.row_count("b").unwrap(), 200);
    tx.rollback();
}

#[test]
fn test_reader_view_stable_while_writers_commit() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_with_table(dir.path());
    {
        let mut tx = db.begin();
        for i in 0..10 {
            tx.insert("t", vec![Cell::Numeric(i as f64)]).unwrap();
        }
        tx.commit().unwrap();
    }

    let reader = db.begin();
    let before: Vec<_> = reader.rows("t").unwrap();

    let writer_db = db.clone();
    thread::spawn(move || {
        for i in 0..20 {
            let mut tx = writer_db.begin();
            tx.insert("t", vec![Cell::Numeric(100.0 + i as f64)]).unwrap();
            tx.commit().unwrap();
        }
    })
    .join()
    .unwrap();

    // Same row set, same order, same cells, no matter how often re-scanned.
    assert_eq!(reader.rows("t").unwrap(), before);
    assert_eq!(reader.row_count("t").unwrap(), 10);
    reader.rollback();

    let fresh = db.begin();
    assert_eq!(fresh.row_count("t").unwrap(), 30);
    fresh.rollback();
}
