use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::crypto::{wal_aad, CryptoBackend, DOMAIN_WAL};
use crate::error::Result;
use crate::wal::record::{Lsn, WalRecord};
use crate::wal::{WAL_HEADER_SIZE, WAL_MAGIC, WAL_VERSION};

/// WAL writer: append-only framed log.
///
/// Framing on disk:
///   [frame_len: u32] [payload]
///
/// Payload (plaintext or AEAD-wrapped as a whole):
///   [lsn: u64] [record bytes] [crc32: u32]   (crc over lsn || record)
pub struct WalWriter {
    file: File,
    path: PathBuf,
    db_id: u64,
    crypto: Option<Arc<dyn CryptoBackend>>,
    next_lsn: Lsn,
}

impl WalWriter {
    /// Create a fresh WAL, truncating any existing file. LSNs continue from
    /// `start_lsn` so they stay monotonic across checkpoints and reopens.
    pub fn create(
        path: &Path,
        db_id: u64,
        crypto: Option<Arc<dyn CryptoBackend>>,
        start_lsn: Lsn,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = WalWriter {
            file,
            path: path.to_path_buf(),
            db_id,
            crypto,
            next_lsn: start_lsn,
        };
        writer.write_header()?;
        Ok(writer)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[0..8].copy_from_slice(WAL_MAGIC);
        header[8..12].copy_from_slice(&WAL_VERSION.to_le_bytes());
        header[16..24].copy_from_slice(&self.db_id.to_le_bytes());
        self.file.write_all(&header)?;
        Ok(())
    }

    /// Append a record. Returns the LSN assigned to it.
    pub fn append(&mut self, record: &WalRecord) -> Result<Lsn> {
        let lsn = self.next_lsn;

        let record_bytes = record.serialize();
        let mut payload = Vec::with_capacity(8 + record_bytes.len() + 4);
        payload.extend_from_slice(&lsn.to_le_bytes());
        payload.extend_from_slice(&record_bytes);
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());

        let frame = match &self.crypto {
            Some(crypto) => crypto.encrypt(DOMAIN_WAL, lsn, &wal_aad(self.db_id, lsn), &payload)?,
            None => payload,
        };

        self.file.write_all(&(frame.len() as u32).to_le_bytes())?;
        self.file.write_all(&frame)?;

        self.next_lsn += 1;
        Ok(lsn)
    }

    /// fsync the WAL. The commit protocol acknowledges only after this.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn
    }

    pub fn size_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Reset the log to a fresh header plus a single Checkpoint record.
    /// Everything before the checkpoint has been materialized into the main
    /// file by the caller.
    pub fn reset_to_checkpoint(&mut self, checkpoint_lsn: Lsn) -> Result<()> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.next_lsn = checkpoint_lsn;
        self.write_header()?;
        self.append(&WalRecord::Checkpoint {
            lsn: checkpoint_lsn,
        })?;
        self.sync()?;
        Ok(())
    }
}
