use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::page_store::PageStore;
use crate::storage::pager::Pager;
use crate::tx::transaction::Transaction;

/// Page store routing a transaction's reads through its dirty buffer and
/// buffering all writes there. The pager lock is taken per page operation,
/// so readers on other connections interleave with a running writer.
pub struct TxPageStore<'a> {
    pager: &'a Mutex<Pager>,
    tx: &'a mut Transaction,
}

impl<'a> TxPageStore<'a> {
    pub fn new(pager: &'a Mutex<Pager>, tx: &'a mut Transaction) -> Self {
        TxPageStore { pager, tx }
    }
}

impl PageStore for TxPageStore<'_> {
    fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.tx.cached(page_id) {
            return Ok(page);
        }
        self.pager.lock().read_page_inner(page_id)
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        let pid = page.id;
        let before = if self.tx.is_dirty(pid) || self.tx.was_allocated(pid) {
            None // kept only on the first write; allocated pages have none
        } else {
            Some(self.pager.lock().read_page_inner(pid)?.data.to_vec())
        };
        self.tx.stage_write(page.clone(), before);
        Ok(())
    }

    fn allocate_page(&mut self, page_type: PageType) -> Result<Page> {
        let pid = self.pager.lock().allocate_page_id();
        self.tx.note_allocated(pid);
        Ok(Page::new(pid, page_type))
    }

    fn free_page(&mut self, page_id: PageId) {
        self.tx.free_page(page_id);
    }

    fn pin(&mut self, page_id: PageId) {
        if !self.tx.is_dirty(page_id) {
            self.pager.lock().pin(page_id);
        }
    }

    fn unpin(&mut self, page_id: PageId) {
        if !self.tx.is_dirty(page_id) {
            self.pager.lock().unpin(page_id);
        }
    }
}
