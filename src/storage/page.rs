//! Slotted page implementation (4096 bytes).
//!
//! Layout:
//!   [PageHeader (16 bytes)] [Cell Pointer Array ...] [Free Space ...] [Cell Data ...]
//!
//! PageHeader:
//!   page_type:  u8  (1=meta, 2=interior, 3=leaf, 4=overflow, 5=free)
//!   reserved:   u8
//!   cell_count: u16
//!   free_start: u16 (offset where the cell pointer array ends)
//!   free_end:   u16 (offset where cell data begins, grows downward)
//!   right_ptr:  u32 (leaf: right sibling; interior: rightmost child;
//!                    overflow: next chain page; 0 = none)
//!   checksum:   u32 (crc32 of the page with this slot zeroed)
//!
//! The pointer array holds cells in logical (key) order regardless of where
//! their bytes physically sit. Removing a cell leaves its data bytes dead
//! until `compact` rebuilds the page.
//!
//! Cell Pointer: u16 (offset to cell data within the page)
//! Cell Data: [u16 len][payload bytes]

use crate::error::{KuraError, Result};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 16;
pub const CELL_POINTER_SIZE: usize = 2;
pub const CELL_HEADER_SIZE: usize = 2; // u16 length prefix

pub type PageId = u32;

pub const NO_PAGE: PageId = 0;

const CHECKSUM_OFFSET: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Meta,
    Interior,
    Leaf,
    Overflow,
    Free,
}

impl PageType {
    pub fn to_tag(self) -> u8 {
        match self {
            PageType::Meta => 1,
            PageType::Interior => 2,
            PageType::Leaf => 3,
            PageType::Overflow => 4,
            PageType::Free => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PageType::Meta),
            2 => Some(PageType::Interior),
            3 => Some(PageType::Leaf),
            4 => Some(PageType::Overflow),
            5 => Some(PageType::Free),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn new(id: PageId, page_type: PageType) -> Self {
        let mut page = Page {
            id,
            data: Box::new([0u8; PAGE_SIZE]),
        };
        page.data[0] = page_type.to_tag();
        page.set_cell_count(0);
        page.set_free_start(PAGE_HEADER_SIZE as u16);
        page.set_free_end(PAGE_SIZE as u16);
        page
    }

    pub fn from_bytes(id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Self {
        Page { id, data }
    }

    // --- Header accessors ---

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_tag(self.data[0])
    }

    pub fn set_page_type(&mut self, t: PageType) {
        self.data[0] = t.to_tag();
    }

    pub fn cell_count(&self) -> u16 {
        u16::from_le_bytes(self.data[2..4].try_into().unwrap())
    }

    fn set_cell_count(&mut self, count: u16) {
        self.data[2..4].copy_from_slice(&count.to_le_bytes());
    }

    pub fn free_start(&self) -> u16 {
        u16::from_le_bytes(self.data[4..6].try_into().unwrap())
    }

    fn set_free_start(&mut self, offset: u16) {
        self.data[4..6].copy_from_slice(&offset.to_le_bytes());
    }

    pub fn free_end(&self) -> u16 {
        u16::from_le_bytes(self.data[6..8].try_into().unwrap())
    }

    fn set_free_end(&mut self, offset: u16) {
        self.data[6..8].copy_from_slice(&offset.to_le_bytes());
    }

    pub fn right_ptr(&self) -> PageId {
        u32::from_le_bytes(self.data[8..12].try_into().unwrap())
    }

    pub fn set_right_ptr(&mut self, pid: PageId) {
        self.data[8..12].copy_from_slice(&pid.to_le_bytes());
    }

    // --- Checksum ---

    fn crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.data[CHECKSUM_OFFSET + 4..]);
        hasher.finalize()
    }

    pub fn update_checksum(&mut self) {
        let crc = self.crc();
        self.data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    }

    /// Verify the header checksum. Must pass before any other header field
    /// is trusted.
    pub fn verify_checksum(&self) -> Result<()> {
        let stored = u32::from_le_bytes(
            self.data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        if stored != self.crc() {
            return Err(KuraError::Corruption(format!(
                "page {} checksum mismatch",
                self.id
            )));
        }
        Ok(())
    }

    // --- Cells ---

    /// Contiguous free space between the pointer array and the cell data.
    pub fn free_space(&self) -> usize {
        let start = self.free_start() as usize;
        let end = self.free_end() as usize;
        end.saturating_sub(start)
    }

    /// Bytes occupied by live cells plus their pointers and the header.
    /// Dead bytes left by removals do not count.
    pub fn live_bytes(&self) -> usize {
        let mut total = PAGE_HEADER_SIZE;
        for i in 0..self.cell_count() {
            if let Some(cell) = self.cell(i) {
                total += CELL_POINTER_SIZE + CELL_HEADER_SIZE + cell.len();
            }
        }
        total
    }

    /// Whether a payload of the given size fits after compaction.
    pub fn fits(&self, payload_len: usize) -> bool {
        let needed = CELL_POINTER_SIZE + CELL_HEADER_SIZE + payload_len;
        PAGE_SIZE - self.live_bytes() >= needed
    }

    /// Insert a cell at logical position `index`, shifting later pointers
    /// right. Compacts the page first if there is dead space to reclaim.
    pub fn insert_cell_at(&mut self, index: u16, payload: &[u8]) -> Result<()> {
        let count = self.cell_count();
        if index > count {
            return Err(KuraError::Internal(format!(
                "cell index {} out of bounds (count {})",
                index, count
            )));
        }

        let total_cell_size = CELL_HEADER_SIZE + payload.len();
        let needed = CELL_POINTER_SIZE + total_cell_size;

        if self.free_space() < needed {
            if !self.fits(payload.len()) {
                return Err(KuraError::Internal("page overflow".into()));
            }
            self.compact();
        }

        // Write cell data at the end of free space (growing downward).
        let cell_offset = self.free_end() as usize - total_cell_size;
        let len = payload.len() as u16;
        self.data[cell_offset..cell_offset + 2].copy_from_slice(&len.to_le_bytes());
        self.data[cell_offset + 2..cell_offset + 2 + payload.len()].copy_from_slice(payload);

        // Shift the pointer array to open a slot at `index`.
        let ptr_base = PAGE_HEADER_SIZE + (index as usize) * CELL_POINTER_SIZE;
        let ptr_end = PAGE_HEADER_SIZE + (count as usize) * CELL_POINTER_SIZE;
        if ptr_base < ptr_end {
            self.data
                .copy_within(ptr_base..ptr_end, ptr_base + CELL_POINTER_SIZE);
        }
        self.data[ptr_base..ptr_base + 2].copy_from_slice(&(cell_offset as u16).to_le_bytes());

        self.set_cell_count(count + 1);
        self.set_free_start(self.free_start() + CELL_POINTER_SIZE as u16);
        self.set_free_end(cell_offset as u16);
        Ok(())
    }

    /// Append a cell at the end of the logical order.
    pub fn push_cell(&mut self, payload: &[u8]) -> Result<()> {
        self.insert_cell_at(self.cell_count(), payload)
    }

    /// Get cell payload by logical index.
    pub fn cell(&self, index: u16) -> Option<&[u8]> {
        if index >= self.cell_count() {
            return None;
        }
        let ptr_offset = PAGE_HEADER_SIZE + (index as usize) * CELL_POINTER_SIZE;
        let cell_offset =
            u16::from_le_bytes(self.data[ptr_offset..ptr_offset + 2].try_into().unwrap()) as usize;
        if cell_offset + 2 > PAGE_SIZE {
            return None;
        }
        let len =
            u16::from_le_bytes(self.data[cell_offset..cell_offset + 2].try_into().unwrap())
                as usize;
        if cell_offset + 2 + len > PAGE_SIZE {
            return None;
        }
        Some(&self.data[cell_offset + 2..cell_offset + 2 + len])
    }

    /// Remove the cell at `index`, shifting later pointers left.
    /// The cell's data bytes stay dead until `compact`.
    pub fn remove_cell(&mut self, index: u16) {
        let count = self.cell_count();
        if index >= count {
            return;
        }
        let start = PAGE_HEADER_SIZE + (index as usize) * CELL_POINTER_SIZE;
        let end = PAGE_HEADER_SIZE + (count as usize) * CELL_POINTER_SIZE;
        if start + CELL_POINTER_SIZE < end {
            self.data.copy_within(start + CELL_POINTER_SIZE..end, start);
        }
        self.set_cell_count(count - 1);
        self.set_free_start(self.free_start() - CELL_POINTER_SIZE as u16);
    }

    /// Rewrite all live cells contiguously, reclaiming dead space.
    pub fn compact(&mut self) {
        let count = self.cell_count();
        let mut cells: Vec<Vec<u8>> = Vec::with_capacity(count as usize);
        for i in 0..count {
            cells.push(self.cell(i).map(|c| c.to_vec()).unwrap_or_default());
        }

        let mut free_end = PAGE_SIZE;
        for (i, payload) in cells.iter().enumerate() {
            let total = CELL_HEADER_SIZE + payload.len();
            free_end -= total;
            self.data[free_end..free_end + 2]
                .copy_from_slice(&(payload.len() as u16).to_le_bytes());
            self.data[free_end + 2..free_end + 2 + payload.len()].copy_from_slice(payload);
            let ptr_offset = PAGE_HEADER_SIZE + i * CELL_POINTER_SIZE;
            self.data[ptr_offset..ptr_offset + 2]
                .copy_from_slice(&(free_end as u16).to_le_bytes());
        }
        self.set_free_end(free_end as u16);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("type", &self.page_type())
            .field("cell_count", &self.cell_count())
            .field("free_start", &self.free_start())
            .field("free_end", &self.free_end())
            .field("right_ptr", &self.right_ptr())
            .finish()
    }
}
