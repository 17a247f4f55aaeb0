//! Write-ahead log: durability, atomic multi-page commits, crash recovery.
//!
//! File layout: a fixed header (magic, version, db_id) followed by framed
//! records. Frame: `[frame_len u32][payload]` where the payload is
//! `lsn (u64) || record bytes || crc32 (u32)` — AEAD-wrapped per frame when
//! the database is encrypted. The WAL is the authoritative source for a page
//! between commit and checkpoint.

pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

pub const WAL_MAGIC: &[u8; 8] = b"KURAWAL1";
pub const WAL_VERSION: u32 = 1;
/// magic(8) + version(4) + reserved(4) + db_id(8)
pub const WAL_HEADER_SIZE: usize = 24;

/// Upper bound for a single frame: a PageWrite carries a before- and an
/// after-image plus framing and AEAD overhead.
pub const MAX_WAL_FRAME_LEN: usize = 2 * crate::storage::page::PAGE_SIZE + 1024;
