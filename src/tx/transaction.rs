use std::collections::{HashMap, HashSet};

use crate::error::{KuraError, Result};
use crate::storage::page::{Page, PageId};
use crate::wal::record::{Lsn, TxId};

/// Transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committing,
    Committed,
    Aborted,
}

/// A write transaction.
///
/// Dirty pages are buffered here, never in the shared page cache, so other
/// connections cannot observe uncommitted state and cache eviction never
/// needs write-back. The first write to a page captures its committed
/// before-image for the WAL record; pages allocated inside the transaction
/// have none.
pub struct Transaction {
    txid: TxId,
    state: TxState,
    started_at_lsn: Lsn,
    dirty: HashMap<PageId, Page>,
    before: HashMap<PageId, Option<Vec<u8>>>,
    allocated: HashSet<PageId>,
    freed: Vec<PageId>,
}

impl Transaction {
    pub fn begin(txid: TxId, started_at_lsn: Lsn) -> Self {
        Transaction {
            txid,
            state: TxState::Active,
            started_at_lsn,
            dirty: HashMap::new(),
            before: HashMap::new(),
            allocated: HashSet::new(),
            freed: Vec::new(),
        }
    }

    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn started_at_lsn(&self) -> Lsn {
        self.started_at_lsn
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(KuraError::Misuse(format!(
                "transaction {} is {:?}",
                self.txid, self.state
            )));
        }
        Ok(())
    }

    /// Dirty-buffer lookup for reads.
    pub fn cached(&self, page_id: PageId) -> Option<Page> {
        self.dirty.get(&page_id).cloned()
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.dirty.contains_key(&page_id)
    }

    /// Buffer a page write. `before` is consulted only on the first write to
    /// the page; later writes keep the original before-image.
    pub fn stage_write(&mut self, page: Page, before: Option<Vec<u8>>) {
        let pid = page.id;
        self.before.entry(pid).or_insert(before);
        self.dirty.insert(pid, page);
    }

    pub fn note_allocated(&mut self, page_id: PageId) {
        self.allocated.insert(page_id);
    }

    pub fn was_allocated(&self, page_id: PageId) -> bool {
        self.allocated.contains(&page_id)
    }

    pub fn free_page(&mut self, page_id: PageId) {
        self.dirty.remove(&page_id);
        self.freed.push(page_id);
    }

    pub fn freed_pages(&self) -> &[PageId] {
        &self.freed
    }

    pub fn before_image(&self, page_id: PageId) -> Option<Vec<u8>> {
        self.before.get(&page_id).cloned().flatten()
    }

    pub fn dirty_page_count(&self) -> usize {
        self.dirty.len()
    }

    /// Dirty pages in page-id order (deterministic WAL layout).
    pub fn dirty_sorted(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.dirty.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn dirty_page(&self, page_id: PageId) -> Option<&Page> {
        self.dirty.get(&page_id)
    }

    pub fn set_committing(&mut self) {
        self.state = TxState::Committing;
    }

    pub fn finish_commit(&mut self) {
        self.dirty.clear();
        self.before.clear();
        self.allocated.clear();
        self.freed.clear();
        self.state = TxState::Committed;
    }

    pub fn finish_abort(&mut self) {
        self.dirty.clear();
        self.before.clear();
        self.allocated.clear();
        self.freed.clear();
        self.state = TxState::Aborted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    #[test]
    fn test_stage_write_keeps_first_before_image() {
        let mut tx = Transaction::begin(1, 0);
        let page = Page::new(5, PageType::Leaf);
        tx.stage_write(page.clone(), Some(vec![1, 2, 3]));
        tx.stage_write(page, Some(vec![9, 9, 9]));
        assert_eq!(tx.before_image(5), Some(vec![1, 2, 3]));
        assert_eq!(tx.dirty_page_count(), 1);
    }

    #[test]
    fn test_freed_page_leaves_dirty_set() {
        let mut tx = Transaction::begin(1, 0);
        tx.stage_write(Page::new(5, PageType::Leaf), None);
        tx.free_page(5);
        assert_eq!(tx.dirty_page_count(), 0);
        assert_eq!(tx.freed_pages(), &[5]);
    }

    #[test]
    fn test_state_transitions() {
        let mut tx = Transaction::begin(7, 3);
        assert_eq!(tx.state(), TxState::Active);
        assert!(tx.ensure_active().is_ok());
        tx.set_committing();
        assert!(tx.ensure_active().is_err());
        tx.finish_commit();
        assert_eq!(tx.state(), TxState::Committed);
    }
}
