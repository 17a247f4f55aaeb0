use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::crypto::CryptoBackend;
use crate::error::{KuraError, Result};
use crate::storage::page::{Page, PAGE_SIZE};
use crate::storage::store::FileStore;
use crate::wal::reader::WalReader;
use crate::wal::record::{Lsn, TxId, WalRecord};

#[derive(Debug, Default)]
struct TxLifecycle {
    seen_begin: bool,
    committed: bool,
}

#[derive(Debug)]
pub struct RecoveryResult {
    pub committed_txids: Vec<TxId>,
    pub discarded_txids: Vec<TxId>,
    pub pages_replayed: usize,
    /// LSN the writer should continue from after recovery.
    pub next_lsn: Lsn,
}

/// Replay the WAL into the main file.
///
/// Committed transactions have their after-images applied in LSN order;
/// transactions without a Commit record (including those cut off by a torn
/// tail) are discarded. Applying the same WAL twice produces the same file
/// state, so a crash during recovery is harmless.
pub fn recover(
    store: &mut FileStore,
    wal_path: &Path,
    db_id: u64,
    crypto: Option<Arc<dyn CryptoBackend>>,
    start_lsn: Lsn,
) -> Result<RecoveryResult> {
    let mut reader = WalReader::open(wal_path, db_id, crypto, start_lsn)?;
    let scan = reader.read_all()?;

    // Nothing in the log authenticated: almost certainly the wrong key.
    // Refuse rather than truncate a log that may hold real commits.
    if scan.first_frame_auth_failure {
        return Err(KuraError::Crypto(
            "WAL authentication failed from the first frame (wrong key?)".into(),
        ));
    }

    if scan.records.is_empty() {
        return Ok(RecoveryResult {
            committed_txids: Vec::new(),
            discarded_txids: Vec::new(),
            pages_replayed: 0,
            next_lsn: start_lsn,
        });
    }

    // Phase 1: validate the per-transaction lifecycle.
    // Allowed: BeginTx -> PageWrite* -> Commit, with nothing after Commit.
    let mut lifecycles: HashMap<TxId, TxLifecycle> = HashMap::new();
    for (lsn, record) in &scan.records {
        match record {
            WalRecord::BeginTx { txid } => {
                let state = lifecycles.entry(*txid).or_default();
                if state.seen_begin {
                    return Err(KuraError::Corruption(format!(
                        "duplicate BeginTx for txid {} at LSN {}",
                        txid, lsn
                    )));
                }
                state.seen_begin = true;
            }
            WalRecord::PageWrite { txid, after, .. } => {
                let state = lifecycles.entry(*txid).or_default();
                if !state.seen_begin {
                    return Err(KuraError::Corruption(format!(
                        "PageWrite before BeginTx for txid {} at LSN {}",
                        txid, lsn
                    )));
                }
                if state.committed {
                    return Err(KuraError::Corruption(format!(
                        "PageWrite after Commit for txid {} at LSN {}",
                        txid, lsn
                    )));
                }
                if after.len() != PAGE_SIZE {
                    return Err(KuraError::Corruption(format!(
                        "after-image at LSN {} is {} bytes",
                        lsn,
                        after.len()
                    )));
                }
            }
            WalRecord::Commit { txid } => {
                let state = lifecycles.entry(*txid).or_default();
                if !state.seen_begin {
                    return Err(KuraError::Corruption(format!(
                        "Commit before BeginTx for txid {} at LSN {}",
                        txid, lsn
                    )));
                }
                if state.committed {
                    return Err(KuraError::Corruption(format!(
                        "duplicate Commit for txid {} at LSN {}",
                        txid, lsn
                    )));
                }
                state.committed = true;
            }
            WalRecord::Checkpoint { .. } => {}
        }
    }

    // Phase 2: replay after-images of committed transactions in LSN order.
    let mut pages_replayed = 0;
    for (lsn, record) in &scan.records {
        if let WalRecord::PageWrite {
            txid,
            page_id,
            after,
            ..
        } = record
        {
            if lifecycles.get(txid).map(|s| s.committed) != Some(true) {
                continue;
            }
            let mut data = Box::new([0u8; PAGE_SIZE]);
            data.copy_from_slice(after);
            store.write_page(&Page::from_bytes(*page_id, data))?;
            pages_replayed += 1;
            debug!("replayed page {} from LSN {}", page_id, lsn);
        }
    }
    if pages_replayed > 0 {
        store.sync()?;
    }

    let mut committed_txids: Vec<TxId> = Vec::new();
    let mut discarded_txids: Vec<TxId> = Vec::new();
    for (txid, state) in &lifecycles {
        if state.committed {
            committed_txids.push(*txid);
        } else {
            discarded_txids.push(*txid);
        }
    }
    committed_txids.sort_unstable();
    discarded_txids.sort_unstable();

    let next_lsn = scan.records.last().map(|(lsn, _)| lsn + 1).unwrap_or(start_lsn);
    info!(
        "WAL recovery: {} committed, {} discarded, {} pages replayed{}",
        committed_txids.len(),
        discarded_txids.len(),
        pages_replayed,
        if scan.torn_tail { " (torn tail truncated)" } else { "" }
    );

    Ok(RecoveryResult {
        committed_txids,
        discarded_txids,
        pages_replayed,
        next_lsn,
    })
}
