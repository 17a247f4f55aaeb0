//! Process-level exclusion.
//!
//! A database file is owned by exactly one process at a time: open takes an
//! exclusive lock on a `.lock` sidecar file and holds it until the database
//! handle drops. A second process opening the same file gets `Busy`
//! immediately. (Intra-process concurrency is handled by the connection
//! pool and the single-writer token, not here.)

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::error::{KuraError, Result};

pub struct ProcessLock {
    lock_file: File,
    #[allow(dead_code)]
    lock_path: PathBuf,
}

impl ProcessLock {
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let lock_path = db_path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        lock_file.try_lock_exclusive().map_err(|_| {
            KuraError::Busy(format!(
                "database {} is locked by another process",
                db_path.display()
            ))
        })?;

        Ok(ProcessLock {
            lock_file,
            lock_path,
        })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}
