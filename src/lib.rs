//! KuraDB: embeddable SQL database engine.
//!
//! A single-file database with:
//! - WAL-backed durability and crash recovery
//! - B+Tree tables and secondary indexes over a pinning page cache
//! - A planner/VM SQL front end with prepared statements
//! - A worker-pool executor with a bounded job queue
//! - Optional AES-256-GCM-SIV page encryption
//!
//! ```no_run
//! let mut conn = kuradb::open(std::path::Path::new("app.db")).unwrap();
//! conn.execute("CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT)").unwrap();
//! conn.execute("INSERT INTO users VALUES (1, 'Alice')").unwrap();
//! let rows = conn.query("SELECT * FROM users").unwrap();
//! assert_eq!(rows.rows.len(), 1);
//! ```

pub mod btree;
pub mod concurrency;
pub mod connection;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod exec;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod tx;
pub mod types;
pub mod wal;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use log::info;
use parking_lot::Mutex;

pub use crate::connection::{Connection, StmtId, StmtState};
pub use crate::error::{KuraError, Result};
pub use crate::exec::{Executor, ExecutorOptions, JobHandle};
pub use crate::sql::vm::QueryResult;
pub use crate::types::{DataType, Value};

use crate::concurrency::ProcessLock;
use crate::crypto::aead::{AeadBackend, MasterKey};
use crate::crypto::{kdf, CryptoBackend};
use crate::schema::catalog::Catalog;
use crate::storage::pager::{Pager, PagerOptions};
use crate::storage::store::{probe_meta, FileStore};

#[derive(Debug, Clone)]
pub struct DbOptions {
    pub pager: PagerOptions,
    /// Busy retries for the single-writer token.
    pub busy_retries: u32,
    pub busy_base_delay_ms: u64,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            pager: PagerOptions::default(),
            busy_retries: 5,
            busy_base_delay_ms: 1,
        }
    }
}

/// State shared by every connection of one database instance.
pub(crate) struct Shared {
    pub(crate) pager: Mutex<Pager>,
    pub(crate) next_txid: AtomicU64,
    /// Single-writer token: holding the one message means holding the
    /// write lock.
    pub(crate) writer_tx: Sender<()>,
    pub(crate) writer_rx: Receiver<()>,
    pub(crate) options: DbOptions,
    #[allow(dead_code)]
    lock: Option<ProcessLock>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

/// Database handle. Cheap to clone; all clones share one pager, WAL and
/// writer token.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

fn wal_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("wal")
}

fn db_id_from_uuid() -> u64 {
    uuid::Uuid::new_v4().as_u128() as u64
}

impl Database {
    /// Create a new unencrypted database file.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_inner(path, None, [0u8; 16], DbOptions::default())
    }

    /// Open an existing database, running WAL recovery first. Creates the
    /// file when it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::create(path);
        }
        Self::open_inner(path, None, DbOptions::default())
    }

    /// Create a new database encrypted with the given key.
    pub fn create_encrypted(path: &Path, key: &MasterKey) -> Result<Self> {
        Self::create_inner(
            path,
            Some(Arc::new(AeadBackend::new(key))),
            [0u8; 16],
            DbOptions::default(),
        )
    }

    pub fn open_encrypted(path: &Path, key: &MasterKey) -> Result<Self> {
        if !path.exists() {
            return Self::create_encrypted(path, key);
        }
        Self::open_inner(
            path,
            Some(Arc::new(AeadBackend::new(key))),
            DbOptions::default(),
        )
    }

    /// Create a database whose key is derived from a password (Argon2id,
    /// per-database salt stored in the meta page).
    pub fn create_with_password(path: &Path, password: &str) -> Result<Self> {
        let salt = kdf::generate_salt();
        let key = kdf::derive_key(password.as_bytes(), &salt)?;
        Self::create_inner(
            path,
            Some(Arc::new(AeadBackend::new(&key))),
            salt,
            DbOptions::default(),
        )
    }

    pub fn open_with_password(path: &Path, password: &str) -> Result<Self> {
        let meta = probe_meta(path)?;
        if !meta.is_encrypted() {
            return Err(KuraError::Crypto("database is not encrypted".into()));
        }
        let key = kdf::derive_key(password.as_bytes(), &meta.salt)?;
        Self::open_inner(
            path,
            Some(Arc::new(AeadBackend::new(&key))),
            DbOptions::default(),
        )
    }

    /// Purely in-memory database: same engine, no file, no WAL.
    pub fn open_memory() -> Result<Self> {
        Self::open_memory_with(DbOptions::default())
    }

    pub fn open_memory_with(options: DbOptions) -> Result<Self> {
        let mut pager = Pager::memory(options.pager)?;
        let catalog = Catalog::create(&mut pager)?;
        pager.set_catalog_root(catalog.root_page_id());
        pager.flush_meta()?;
        Ok(Self::assemble(pager, None, None, options))
    }

    fn create_inner(
        path: &Path,
        crypto: Option<Arc<dyn CryptoBackend>>,
        salt: [u8; 16],
        options: DbOptions,
    ) -> Result<Self> {
        let lock = ProcessLock::acquire(path)?;
        let db_id = db_id_from_uuid();
        let mut pager = Pager::create_file(
            path,
            &wal_path(path),
            crypto,
            db_id,
            salt,
            options.pager,
        )?;
        let catalog = Catalog::create(&mut pager)?;
        pager.set_catalog_root(catalog.root_page_id());
        pager.flush_meta()?;
        Ok(Self::assemble(
            pager,
            Some(lock),
            Some(path.to_path_buf()),
            options,
        ))
    }

    fn open_inner(
        path: &Path,
        crypto: Option<Arc<dyn CryptoBackend>>,
        options: DbOptions,
    ) -> Result<Self> {
        let lock = ProcessLock::acquire(path)?;

        let meta = probe_meta(path)?;
        if meta.is_encrypted() && crypto.is_none() {
            return Err(KuraError::Crypto(
                "database is encrypted; a key is required".into(),
            ));
        }
        if !meta.is_encrypted() && crypto.is_some() {
            return Err(KuraError::Crypto("database is not encrypted".into()));
        }

        // WAL recovery runs before the pager exists; a failure here leaves
        // the main file untouched beyond already-committed replays.
        let wp = wal_path(path);
        let mut start_lsn = meta.checkpoint_lsn;
        if wp.exists() {
            let mut store = FileStore::open(path, crypto.clone(), &meta)?;
            let report = wal::recovery::recover(
                &mut store,
                &wp,
                meta.db_id,
                crypto.clone(),
                meta.checkpoint_lsn,
            )?;
            start_lsn = report.next_lsn;
            if !report.committed_txids.is_empty() {
                info!(
                    "recovered {} committed transactions from WAL",
                    report.committed_txids.len()
                );
            }

            // Page 0 may have been replayed; reload and stamp the new
            // checkpoint position before the WAL is truncated. The stamp
            // must match the WAL writer's start position exactly, or the
            // next recovery would see an LSN discontinuity and discard
            // valid commits.
            let mut meta = probe_meta(path)?;
            if meta.checkpoint_lsn != start_lsn || report.pages_replayed > 0 {
                meta.checkpoint_lsn = start_lsn;
                store.write_page(&meta.encode_page())?;
                store.sync()?;
            }
            truncate_wal_durably(&wp)?;
        }

        let meta = probe_meta(path)?;
        let pager = Pager::open_file(path, &wp, crypto, meta, start_lsn, options.pager)?;
        Ok(Self::assemble(
            pager,
            Some(lock),
            Some(path.to_path_buf()),
            options,
        ))
    }

    fn assemble(
        pager: Pager,
        lock: Option<ProcessLock>,
        path: Option<PathBuf>,
        options: DbOptions,
    ) -> Self {
        let (writer_tx, writer_rx) = bounded(1);
        writer_tx.send(()).expect("writer token fits");
        let next_txid = AtomicU64::new(pager.next_txid());
        Database {
            shared: Arc::new(Shared {
                pager: Mutex::new(pager),
                next_txid,
                writer_tx,
                writer_rx,
                options,
                lock,
                path,
            }),
        }
    }

    /// Open a new connection against this database.
    pub fn connect(&self) -> Connection {
        Connection::new(self.shared.clone())
    }

    /// Build a worker-pool executor over this database.
    pub fn executor(&self, options: ExecutorOptions) -> Executor {
        Executor::new(self, options)
    }
}

/// Truncate and fsync the WAL (and its directory) after recovery.
fn truncate_wal_durably(wal_path: &Path) -> Result<()> {
    let wal_file = std::fs::File::create(wal_path)?;
    wal_file.sync_all()?;
    if let Some(parent) = wal_path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Open (creating if absent) a file-backed database and return its first
/// connection.
pub fn open(path: &Path) -> Result<Connection> {
    Ok(Database::open(path)?.connect())
}

/// Open an in-memory database and return its first connection.
pub fn open_memory() -> Result<Connection> {
    Ok(Database::open_memory()?.connect())
}
