//! Crash recovery: committed transactions survive an unclean shutdown,
//! uncommitted ones vanish, torn tails are truncated, and recovery is
//! idempotent.
//!
//! A "crash" is simulated by dropping the database without a checkpoint:
//! committed pages then exist only in the WAL, and uncommitted pages
//! existed only in memory.

use std::io::Write;

use kuradb::storage::store::{probe_meta, FileStore};
use kuradb::{Database, Value};
use tempfile::TempDir;

fn count(conn: &mut kuradb::Connection, table: &str) -> i64 {
    let result = conn
        .query(&format!("SELECT count(*) FROM {}", table))
        .unwrap();
    match result.rows[0][0] {
        Value::Integer(n) => n,
        ref other => panic!("unexpected count value {:?}", other),
    }
}

#[test]
fn test_committed_transaction_survives_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.db");

    {
        let mut conn = kuradb::open(&path).unwrap();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        conn.execute("BEGIN").unwrap();
        for i in 0..100 {
            conn.execute(&format!("INSERT INTO t VALUES ({}, 'row-{}')", i, i))
                .unwrap();
        }
        conn.execute("COMMIT").unwrap();
        // No checkpoint: the rows live only in the WAL now.
    }

    let mut conn = kuradb::open(&path).unwrap();
    assert_eq!(count(&mut conn, "t"), 100);
    let result = conn.query("SELECT v FROM t WHERE id = 42").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Text("row-42".into())]]);
}

#[test]
fn test_uncommitted_transaction_discarded_on_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash2.db");

    {
        let mut conn = kuradb::open(&path).unwrap();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute("BEGIN").unwrap();
        for i in 0..100 {
            conn.execute(&format!("INSERT INTO t VALUES ({})", i))
                .unwrap();
        }
        // Crash before COMMIT.
    }

    let mut conn = kuradb::open(&path).unwrap();
    assert_eq!(count(&mut conn, "t"), 0);
}

#[test]
fn test_recovery_across_generations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gen.db");

    for generation in 0..3 {
        let mut conn = kuradb::open(&path).unwrap();
        if generation == 0 {
            conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
                .unwrap();
        }
        conn.execute("BEGIN").unwrap();
        for i in 0..20 {
            conn.execute(&format!(
                "INSERT INTO t VALUES ({})",
                generation * 20 + i
            ))
            .unwrap();
        }
        conn.execute("COMMIT").unwrap();
    }

    let mut conn = kuradb::open(&path).unwrap();
    assert_eq!(count(&mut conn, "t"), 60);
}

#[test]
fn test_torn_tail_truncated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("torn.db");
    let wal = dir.path().join("torn.wal");

    {
        let mut conn = kuradb::open(&path).unwrap();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute("BEGIN").unwrap();
        for i in 0..10 {
            conn.execute(&format!("INSERT INTO t VALUES ({})", i))
                .unwrap();
        }
        conn.execute("COMMIT").unwrap();
    }

    // A crashed append leaves a half-written frame at the tail.
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .open(&wal)
        .unwrap();
    f.write_all(&[0x80, 0x02, 0x00, 0x00, 0xDE, 0xAD, 0xBE]).unwrap();
    drop(f);

    let mut conn = kuradb::open(&path).unwrap();
    assert_eq!(count(&mut conn, "t"), 10);
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idem.db");
    let wal = dir.path().join("idem.wal");

    {
        let mut conn = kuradb::open(&path).unwrap();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        conn.execute("BEGIN").unwrap();
        for i in 0..30 {
            conn.execute(&format!("INSERT INTO t VALUES ({}, 'v{}')", i, i))
                .unwrap();
        }
        conn.execute("COMMIT").unwrap();
    }

    // Replay the same WAL into the main file twice by hand; the second
    // pass must produce the same bytes as the first.
    let meta = probe_meta(&path).unwrap();
    let mut store = FileStore::open(&path, None, &meta).unwrap();
    kuradb::wal::recovery::recover(&mut store, &wal, meta.db_id, None, meta.checkpoint_lsn)
        .unwrap();
    drop(store);
    let first = std::fs::read(&path).unwrap();

    let meta = probe_meta(&path).unwrap();
    let mut store = FileStore::open(&path, None, &meta).unwrap();
    kuradb::wal::recovery::recover(&mut store, &wal, meta.db_id, None, meta.checkpoint_lsn)
        .unwrap();
    drop(store);
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second, "recovery must be idempotent");

    // And the recovered database is fully usable.
    let mut conn = kuradb::open(&path).unwrap();
    assert_eq!(count(&mut conn, "t"), 30);
}

#[test]
fn test_checkpoint_truncates_wal_and_preserves_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ckpt.db");
    let wal = dir.path().join("ckpt.wal");

    {
        let mut conn = kuradb::open(&path).unwrap();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute("BEGIN").unwrap();
        for i in 0..200 {
            conn.execute(&format!("INSERT INTO t VALUES ({})", i))
                .unwrap();
        }
        conn.execute("COMMIT").unwrap();

        let wal_size = std::fs::metadata(&wal).unwrap().len();
        conn.checkpoint().unwrap();
        assert!(std::fs::metadata(&wal).unwrap().len() < wal_size);
    }

    let mut conn = kuradb::open(&path).unwrap();
    assert_eq!(count(&mut conn, "t"), 200);
}

#[test]
fn test_auto_checkpoint_by_wal_size() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("auto.db");
    let wal = dir.path().join("auto.wal");

    let db = Database::open(&path).unwrap();
    let mut conn = db.connect();
    conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, pad TEXT)")
        .unwrap();

    // Each commit ships full page images; enough of them must cross the
    // default 4 MiB threshold and trigger a checkpoint.
    let pad = "p".repeat(500);
    for i in 0..1200 {
        conn.execute(&format!("INSERT INTO t VALUES ({}, '{}')", i, pad))
            .unwrap();
    }

    let wal_size = std::fs::metadata(&wal).unwrap().len();
    assert!(
        wal_size < 8 * 1024 * 1024,
        "WAL grew unbounded ({} bytes); auto-checkpoint never fired",
        wal_size
    );
    assert_eq!(count(&mut conn, "t"), 1200);
}
