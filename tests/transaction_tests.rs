//! Explicit transactions: rollback semantics, isolation, writer exclusion.

use kuradb::{Database, KuraError, Value};
use tempfile::TempDir;

#[test]
fn test_rollback_discards_changes() {
    let mut conn = kuradb::open_memory().unwrap();
    conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
        .unwrap();

    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (1)").unwrap();
    conn.execute("ROLLBACK").unwrap();

    let result = conn.query("SELECT count(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(0)]]);
}

#[test]
fn test_commit_persists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tx.db");

    {
        let mut conn = kuradb::open(&path).unwrap();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute("BEGIN").unwrap();
        for i in 0..50 {
            conn.execute(&format!("INSERT INTO t VALUES ({})", i))
                .unwrap();
        }
        conn.execute("COMMIT").unwrap();
    }

    let mut conn = kuradb::open(&path).unwrap();
    let result = conn.query("SELECT count(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(50)]]);
}

#[test]
fn test_rollback_leaves_file_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ident.db");
    let wal = dir.path().join("ident.wal");

    let mut conn = kuradb::open(&path).unwrap();
    conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    conn.execute("INSERT INTO t VALUES (1, 'base')").unwrap();
    conn.checkpoint().unwrap();

    let before = std::fs::read(&path).unwrap();
    let wal_before = std::fs::read(&wal).unwrap();

    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (2, 'phantom')").unwrap();
    conn.execute("UPDATE t SET v = 'changed' WHERE id = 1")
        .unwrap();
    conn.execute("ROLLBACK").unwrap();

    assert_eq!(
        before,
        std::fs::read(&path).unwrap(),
        "rollback must leave the database file bit-identical"
    );
    assert_eq!(
        wal_before,
        std::fs::read(&wal).unwrap(),
        "rollback must not append to the WAL"
    );
}

#[test]
fn test_rollback_restores_schema() {
    let mut conn = kuradb::open_memory().unwrap();
    conn.execute("BEGIN").unwrap();
    conn.execute("CREATE TABLE temp_t(id INTEGER PRIMARY KEY)")
        .unwrap();
    conn.execute("INSERT INTO temp_t VALUES (1)").unwrap();
    conn.execute("ROLLBACK").unwrap();

    assert!(matches!(
        conn.query("SELECT * FROM temp_t"),
        Err(KuraError::Schema(_))
    ));
}

#[test]
fn test_tx_sees_own_writes() {
    let mut conn = kuradb::open_memory().unwrap();
    conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
        .unwrap();

    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (7)").unwrap();
    let result = conn.query("SELECT count(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);
    conn.execute("COMMIT").unwrap();
}

#[test]
fn test_readers_do_not_see_uncommitted_writes() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("iso.db")).unwrap();

    let mut writer = db.connect();
    writer
        .execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
        .unwrap();

    writer.execute("BEGIN").unwrap();
    writer.execute("INSERT INTO t VALUES (1)").unwrap();

    let mut reader = db.connect();
    let result = reader.query("SELECT count(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(0)]]);

    writer.execute("COMMIT").unwrap();
    let result = reader.query("SELECT count(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn test_single_writer_contention_is_busy() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("busy.db")).unwrap();

    let mut a = db.connect();
    a.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
    a.execute("BEGIN").unwrap();
    a.execute("INSERT INTO t VALUES (1)").unwrap();

    let mut b = db.connect();
    assert!(matches!(b.execute("BEGIN"), Err(KuraError::Busy(_))));
    assert!(matches!(
        b.execute("INSERT INTO t VALUES (2)"),
        Err(KuraError::Busy(_))
    ));
    // Reads are not blocked by the writer.
    b.query("SELECT count(*) FROM t").unwrap();

    a.execute("COMMIT").unwrap();
    b.execute("INSERT INTO t VALUES (2)").unwrap();
}

#[test]
fn test_statement_error_aborts_transaction() {
    let mut conn = kuradb::open_memory().unwrap();
    conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
        .unwrap();
    conn.execute("INSERT INTO t VALUES (1)").unwrap();

    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (2)").unwrap();
    // Duplicate pk fails and takes the whole transaction down with it.
    let err = conn.execute("INSERT INTO t VALUES (1)").unwrap_err();
    assert!(matches!(err, KuraError::Schema(_)));

    // The transaction is gone; COMMIT is a misuse and row 2 never landed.
    assert!(matches!(conn.execute("COMMIT"), Err(KuraError::Misuse(_))));
    let result = conn.query("SELECT count(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn test_tx_misuse() {
    let mut conn = kuradb::open_memory().unwrap();
    assert!(matches!(conn.execute("COMMIT"), Err(KuraError::Misuse(_))));
    assert!(matches!(
        conn.execute("ROLLBACK"),
        Err(KuraError::Misuse(_))
    ));
    conn.execute("BEGIN").unwrap();
    assert!(matches!(conn.execute("BEGIN"), Err(KuraError::Misuse(_))));
    conn.execute("ROLLBACK").unwrap();
}

#[test]
fn test_dropped_connection_releases_writer() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("drop.db")).unwrap();

    {
        let mut a = db.connect();
        a.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
        a.execute("BEGIN").unwrap();
        a.execute("INSERT INTO t VALUES (1)").unwrap();
        // Dropped mid-transaction: rolls back and releases the writer.
    }

    let mut b = db.connect();
    b.execute("INSERT INTO t VALUES (1)").unwrap();
    let result = b.query("SELECT count(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);
}
