use crate::error::Result;
use crate::storage::page::{Page, PageId, PageType};

/// Abstraction over page I/O.
///
/// Implemented by `Pager` (direct cache/store access, used while
/// bootstrapping a database) and `TxPageStore` (transaction dirty-buffer).
///
/// `pin`/`unpin` guard a page against cache eviction while a cursor is
/// parked on it; they never fail and are no-ops for pages that only exist
/// in a transaction buffer.
pub trait PageStore {
    fn read_page(&mut self, page_id: PageId) -> Result<Page>;
    fn write_page(&mut self, page: &Page) -> Result<()>;
    fn allocate_page(&mut self, page_type: PageType) -> Result<Page>;
    fn free_page(&mut self, page_id: PageId);
    fn pin(&mut self, page_id: PageId);
    fn unpin(&mut self, page_id: PageId);
}

/// Read-only view of the shared pager for statements outside a transaction.
/// Any attempted mutation is an internal error: read paths never write.
pub struct ReadPageStore<'a> {
    pager: &'a parking_lot::Mutex<crate::storage::pager::Pager>,
}

impl<'a> ReadPageStore<'a> {
    pub fn new(pager: &'a parking_lot::Mutex<crate::storage::pager::Pager>) -> Self {
        ReadPageStore { pager }
    }
}

impl PageStore for ReadPageStore<'_> {
    fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        self.pager.lock().read_page_inner(page_id)
    }

    fn write_page(&mut self, _page: &Page) -> Result<()> {
        Err(crate::error::KuraError::Internal(
            "write through read-only page store".into(),
        ))
    }

    fn allocate_page(&mut self, _page_type: PageType) -> Result<Page> {
        Err(crate::error::KuraError::Internal(
            "allocation through read-only page store".into(),
        ))
    }

    fn free_page(&mut self, _page_id: PageId) {}

    fn pin(&mut self, page_id: PageId) {
        self.pager.lock().pin(page_id);
    }

    fn unpin(&mut self, page_id: PageId) {
        self.pager.lock().unpin(page_id);
    }
}
