//! At-rest encryption: keyed and password-derived databases, wrong-key
//! rejection, encrypted WAL recovery, and on-disk opacity.

use kuradb::crypto::aead::MasterKey;
use kuradb::{Database, KuraError, Value};
use tempfile::TempDir;

fn test_key() -> MasterKey {
    MasterKey::new([0x42u8; 32])
}

#[test]
fn test_encrypted_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("enc.db");

    {
        let db = Database::create_encrypted(&path, &test_key()).unwrap();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE secrets(id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        conn.execute("INSERT INTO secrets VALUES (1, 'classified')")
            .unwrap();
        conn.checkpoint().unwrap();
    }

    let db = Database::open_encrypted(&path, &test_key()).unwrap();
    let mut conn = db.connect();
    let result = conn.query("SELECT v FROM secrets WHERE id = 1").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Text("classified".into())]]);
}

#[test]
fn test_wrong_key_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("enc.db");

    {
        let db = Database::create_encrypted(&path, &test_key()).unwrap();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.checkpoint().unwrap();
    }

    let wrong = MasterKey::new([0x99u8; 32]);
    let err = match Database::open_encrypted(&path, &wrong) {
        Err(e) => e,
        Ok(db) => {
            // Open may succeed before any page is touched; the first read
            // must fail authentication.
            let mut conn = db.connect();
            conn.query("SELECT count(*) FROM t").unwrap_err()
        }
    };
    assert!(matches!(err, KuraError::Crypto(_) | KuraError::Corruption(_)));
}

#[test]
fn test_missing_key_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("enc.db");
    {
        let _db = Database::create_encrypted(&path, &test_key()).unwrap();
    }
    assert!(matches!(
        Database::open(&path),
        Err(KuraError::Crypto(_))
    ));
}

#[test]
fn test_password_derived_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pw.db");

    {
        let db = Database::create_with_password(&path, "correct horse").unwrap();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        conn.execute("INSERT INTO t VALUES (1, 'locked')").unwrap();
        conn.checkpoint().unwrap();
    }

    {
        let db = Database::open_with_password(&path, "correct horse").unwrap();
        let mut conn = db.connect();
        let result = conn.query("SELECT v FROM t").unwrap();
        assert_eq!(result.rows, vec![vec![Value::Text("locked".into())]]);
    }

    let err = match Database::open_with_password(&path, "wrong password") {
        Err(e) => e,
        Ok(db) => {
            let mut conn = db.connect();
            conn.query("SELECT count(*) FROM t").unwrap_err()
        }
    };
    assert!(matches!(err, KuraError::Crypto(_) | KuraError::Corruption(_)));
}

#[test]
fn test_encrypted_wal_recovery() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("encwal.db");

    {
        let db = Database::create_encrypted(&path, &test_key()).unwrap();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute("BEGIN").unwrap();
        for i in 0..50 {
            conn.execute(&format!("INSERT INTO t VALUES ({})", i))
                .unwrap();
        }
        conn.execute("COMMIT").unwrap();
        // Crash without checkpoint: recovery must decrypt the WAL.
    }

    let db = Database::open_encrypted(&path, &test_key()).unwrap();
    let mut conn = db.connect();
    let result = conn.query("SELECT count(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(50)]]);
}

#[test]
fn test_plaintext_does_not_leak_to_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("leak.db");
    let needle = b"THE-SECRET-NEEDLE-VALUE";

    {
        let db = Database::create_encrypted(&path, &test_key()).unwrap();
        let mut conn = db.connect();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        conn.execute("INSERT INTO t VALUES (1, 'THE-SECRET-NEEDLE-VALUE')")
            .unwrap();
        conn.checkpoint().unwrap();
    }

    for file in [path.clone(), path.with_extension("wal")] {
        let bytes = std::fs::read(&file).unwrap();
        let found = bytes
            .windows(needle.len())
            .any(|window| window == needle);
        assert!(!found, "plaintext leaked into {}", file.display());
    }
}
