//! WAL record types.
//!
//! Record payload (inside a frame, before the CRC):
//!   BeginTx(txid)
//!   PageWrite(txid, page_id, before?, after)
//!   Commit(txid)
//!   Checkpoint(lsn)
//!
//! PageWrite carries the full before-image (absent for freshly allocated
//! pages) and after-image of one page. Recovery replays after-images of
//! committed transactions only.

use crate::storage::page::PageId;

pub type TxId = u64;
pub type Lsn = u64;

#[derive(Debug, Clone)]
pub enum WalRecord {
    BeginTx {
        txid: TxId,
    },
    PageWrite {
        txid: TxId,
        page_id: PageId,
        before: Option<Vec<u8>>,
        after: Vec<u8>,
    },
    Commit {
        txid: TxId,
    },
    Checkpoint {
        lsn: Lsn,
    },
}

const TAG_BEGIN: u8 = 1;
const TAG_PAGE_WRITE: u8 = 2;
const TAG_COMMIT: u8 = 3;
const TAG_CHECKPOINT: u8 = 4;

impl WalRecord {
    pub fn txid(&self) -> Option<TxId> {
        match self {
            WalRecord::BeginTx { txid } => Some(*txid),
            WalRecord::PageWrite { txid, .. } => Some(*txid),
            WalRecord::Commit { txid } => Some(*txid),
            WalRecord::Checkpoint { .. } => None,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            WalRecord::BeginTx { txid } => {
                let mut buf = Vec::with_capacity(1 + 8);
                buf.push(TAG_BEGIN);
                buf.extend_from_slice(&txid.to_le_bytes());
                buf
            }
            WalRecord::PageWrite {
                txid,
                page_id,
                before,
                after,
            } => {
                let before_len = before.as_ref().map(|b| b.len()).unwrap_or(0);
                let mut buf = Vec::with_capacity(1 + 8 + 4 + 1 + 4 + before_len + 4 + after.len());
                buf.push(TAG_PAGE_WRITE);
                buf.extend_from_slice(&txid.to_le_bytes());
                buf.extend_from_slice(&page_id.to_le_bytes());
                match before {
                    Some(b) => {
                        buf.push(1);
                        buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                        buf.extend_from_slice(b);
                    }
                    None => buf.push(0),
                }
                buf.extend_from_slice(&(after.len() as u32).to_le_bytes());
                buf.extend_from_slice(after);
                buf
            }
            WalRecord::Commit { txid } => {
                let mut buf = Vec::with_capacity(1 + 8);
                buf.push(TAG_COMMIT);
                buf.extend_from_slice(&txid.to_le_bytes());
                buf
            }
            WalRecord::Checkpoint { lsn } => {
                let mut buf = Vec::with_capacity(1 + 8);
                buf.push(TAG_CHECKPOINT);
                buf.extend_from_slice(&lsn.to_le_bytes());
                buf
            }
        }
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        match data[0] {
            TAG_BEGIN => {
                let txid = u64::from_le_bytes(data.get(1..9)?.try_into().ok()?);
                Some(WalRecord::BeginTx { txid })
            }
            TAG_PAGE_WRITE => {
                let txid = u64::from_le_bytes(data.get(1..9)?.try_into().ok()?);
                let page_id = u32::from_le_bytes(data.get(9..13)?.try_into().ok()?);
                let mut pos = 13;
                let has_before = *data.get(pos)?;
                pos += 1;
                let before = if has_before == 1 {
                    let len =
                        u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?) as usize;
                    pos += 4;
                    let bytes = data.get(pos..pos + len)?.to_vec();
                    pos += len;
                    Some(bytes)
                } else {
                    None
                };
                let after_len =
                    u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?) as usize;
                pos += 4;
                let after = data.get(pos..pos + after_len)?.to_vec();
                Some(WalRecord::PageWrite {
                    txid,
                    page_id,
                    before,
                    after,
                })
            }
            TAG_COMMIT => {
                let txid = u64::from_le_bytes(data.get(1..9)?.try_into().ok()?);
                Some(WalRecord::Commit { txid })
            }
            TAG_CHECKPOINT => {
                let lsn = u64::from_le_bytes(data.get(1..9)?.try_into().ok()?);
                Some(WalRecord::Checkpoint { lsn })
            }
            _ => None,
        }
    }
}
