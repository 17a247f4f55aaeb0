use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use log::warn;

use crate::crypto::{wal_aad, CryptoBackend};
use crate::error::{KuraError, Result};
use crate::wal::record::{Lsn, WalRecord};
use crate::wal::{MAX_WAL_FRAME_LEN, WAL_HEADER_SIZE, WAL_MAGIC, WAL_VERSION};

/// WAL reader: iterate frames for recovery.
///
/// Frames are strictly sequential; the reader tracks the expected LSN and
/// stops at the first frame that fails a bounds check, authentication, CRC,
/// LSN continuity, or record parsing. Everything after that point is the
/// torn tail of a crashed append and is discarded.
pub struct WalReader {
    file: File,
    db_id: u64,
    crypto: Option<Arc<dyn CryptoBackend>>,
    expected_lsn: Lsn,
    remaining: u64,
}

#[derive(Debug)]
pub struct WalScan {
    pub records: Vec<(Lsn, WalRecord)>,
    /// True when the scan stopped before EOF on an invalid frame.
    pub torn_tail: bool,
    /// The very first frame failed AEAD authentication. A torn append
    /// fails the structural checks instead, so this almost always means
    /// the wrong key — recovery must refuse rather than truncate.
    pub first_frame_auth_failure: bool,
}

enum FrameError {
    Structural(String),
    Auth,
}

impl WalReader {
    pub fn open(
        path: &Path,
        db_id: u64,
        crypto: Option<Arc<dyn CryptoBackend>>,
        start_lsn: Lsn,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        if file_len < WAL_HEADER_SIZE as u64 {
            // Empty or torn-at-header WAL: nothing to replay.
            return Ok(WalReader {
                file,
                db_id,
                crypto,
                expected_lsn: start_lsn,
                remaining: 0,
            });
        }

        let mut header = [0u8; WAL_HEADER_SIZE];
        file.read_exact(&mut header)?;
        if &header[0..8] != WAL_MAGIC {
            return Err(KuraError::Corruption("bad WAL magic".into()));
        }
        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if version > WAL_VERSION {
            return Err(KuraError::Corruption(format!(
                "unsupported WAL format version {}",
                version
            )));
        }
        let wal_db_id = u64::from_le_bytes(header[16..24].try_into().unwrap());
        if wal_db_id != db_id {
            return Err(KuraError::Corruption(
                "WAL belongs to a different database".into(),
            ));
        }

        Ok(WalReader {
            file,
            db_id,
            crypto,
            expected_lsn: start_lsn,
            remaining: file_len - WAL_HEADER_SIZE as u64,
        })
    }

    /// Read all complete, valid records up to the torn tail.
    pub fn read_all(&mut self) -> Result<WalScan> {
        let mut records = Vec::new();
        loop {
            match self.read_frame() {
                Ok(Some(entry)) => records.push(entry),
                Ok(None) => {
                    return Ok(WalScan {
                        records,
                        torn_tail: false,
                        first_frame_auth_failure: false,
                    })
                }
                Err(e) => {
                    let (reason, auth) = match e {
                        FrameError::Structural(msg) => (msg, false),
                        FrameError::Auth => ("frame authentication failed".to_string(), true),
                    };
                    warn!(
                        "WAL torn tail at lsn {} ({} records recovered): {}",
                        self.expected_lsn,
                        records.len(),
                        reason
                    );
                    return Ok(WalScan {
                        first_frame_auth_failure: auth && records.is_empty(),
                        records,
                        torn_tail: true,
                    });
                }
            }
        }
    }

    /// Ok(None) = clean EOF. Err = torn tail (not fatal by itself).
    fn read_frame(&mut self) -> std::result::Result<Option<(Lsn, WalRecord)>, FrameError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.remaining < 4 {
            return Err(FrameError::Structural(
                "trailing bytes shorter than a frame header".into(),
            ));
        }

        let mut len_buf = [0u8; 4];
        self.file
            .read_exact(&mut len_buf)
            .map_err(|e| FrameError::Structural(e.to_string()))?;
        self.remaining -= 4;
        let frame_len = u32::from_le_bytes(len_buf) as u64;

        if frame_len == 0 || frame_len > MAX_WAL_FRAME_LEN as u64 {
            return Err(FrameError::Structural(format!(
                "implausible frame length {}",
                frame_len
            )));
        }
        if frame_len > self.remaining {
            return Err(FrameError::Structural(
                "frame extends past end of file".into(),
            ));
        }

        let mut frame = vec![0u8; frame_len as usize];
        self.file
            .read_exact(&mut frame)
            .map_err(|e| FrameError::Structural(e.to_string()))?;
        self.remaining -= frame_len;

        let payload = match &self.crypto {
            Some(crypto) => crypto
                .decrypt(&wal_aad(self.db_id, self.expected_lsn), &frame)
                .map_err(|_| FrameError::Auth)?,
            None => frame,
        };

        if payload.len() < 8 + 4 {
            return Err(FrameError::Structural("frame payload too short".into()));
        }
        let body = &payload[..payload.len() - 4];
        let stored_crc =
            u32::from_le_bytes(payload[payload.len() - 4..].try_into().unwrap());
        if crc32fast::hash(body) != stored_crc {
            return Err(FrameError::Structural("frame CRC mismatch".into()));
        }

        let lsn = u64::from_le_bytes(body[0..8].try_into().unwrap());
        if lsn != self.expected_lsn {
            return Err(FrameError::Structural(format!(
                "LSN discontinuity: expected {}, found {}",
                self.expected_lsn, lsn
            )));
        }

        let record = WalRecord::deserialize(&body[8..])
            .ok_or_else(|| FrameError::Structural("unparseable record".into()))?;
        self.expected_lsn += 1;
        Ok(Some((lsn, record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::writer::WalWriter;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let mut writer = WalWriter::create(&path, 7, None, 0).unwrap();
        writer.append(&WalRecord::BeginTx { txid: 1 }).unwrap();
        writer
            .append(&WalRecord::PageWrite {
                txid: 1,
                page_id: 2,
                before: None,
                after: vec![0xAB; 100],
            })
            .unwrap();
        writer.append(&WalRecord::Commit { txid: 1 }).unwrap();
        writer.sync().unwrap();

        let mut reader = WalReader::open(&path, 7, None, 0).unwrap();
        let scan = reader.read_all().unwrap();
        assert!(!scan.torn_tail);
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.records[0].0, 0);
        assert_eq!(scan.records[2].0, 2);
    }

    #[test]
    fn test_torn_tail_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.wal");
        let mut writer = WalWriter::create(&path, 7, None, 0).unwrap();
        writer.append(&WalRecord::BeginTx { txid: 1 }).unwrap();
        writer.append(&WalRecord::Commit { txid: 1 }).unwrap();
        writer.sync().unwrap();

        // Simulate a crashed append: garbage half-frame at the end.
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        f.write_all(&[0x44, 0x00, 0x00, 0x00, 0xDE, 0xAD]).unwrap();
        drop(f);

        let mut reader = WalReader::open(&path, 7, None, 0).unwrap();
        let scan = reader.read_all().unwrap();
        assert!(scan.torn_tail);
        assert_eq!(scan.records.len(), 2);
    }

    #[test]
    fn test_wrong_db_id_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.wal");
        let mut writer = WalWriter::create(&path, 7, None, 0).unwrap();
        writer.append(&WalRecord::BeginTx { txid: 1 }).unwrap();
        writer.sync().unwrap();

        assert!(WalReader::open(&path, 8, None, 0).is_err());
    }
}
