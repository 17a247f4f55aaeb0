//! B+-tree node layouts on slotted pages.
//!
//! The page header's type field distinguishes leaf from interior pages;
//! `right_ptr` holds the right sibling for leaves and the rightmost child
//! for interior pages.
//!
//! Leaf cell:
//!   [flags: u8] [key_len: u16] [key]
//!     flags=0: [value bytes]
//!     flags=1: [total_len: u32] [first_overflow_page: u32]
//!
//! Interior cell:
//!   [child: u32] [key_len: u16] [key]
//!
//! An interior cell's child subtree holds keys strictly less than its
//! separator and no less than the previous cell's separator.

use crate::error::{KuraError, Result};
use crate::storage::page::{Page, PageId, PageType, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::page_store::PageStore;

const LEAF_FLAG_INLINE: u8 = 0;
const LEAF_FLAG_OVERFLOW: u8 = 1;

/// Values above this spill into an overflow chain.
pub const MAX_INLINE_VALUE: usize = 768;

/// Payload bytes per overflow page: [chunk_len u16][bytes].
const OVERFLOW_CHUNK: usize = PAGE_SIZE - PAGE_HEADER_SIZE - 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue<'a> {
    Inline(&'a [u8]),
    Overflow { total_len: u32, first_page: PageId },
}

// --- Leaf cells ---

pub fn encode_leaf_inline(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + key.len() + value.len());
    buf.push(LEAF_FLAG_INLINE);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

pub fn encode_leaf_overflow(key: &[u8], total_len: u32, first_page: PageId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + key.len() + 8);
    buf.push(LEAF_FLAG_OVERFLOW);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf.extend_from_slice(&first_page.to_le_bytes());
    buf
}

pub fn decode_leaf_cell(cell: &[u8]) -> Result<(&[u8], LeafValue<'_>)> {
    if cell.len() < 3 {
        return Err(KuraError::Corruption("leaf cell truncated".into()));
    }
    let flags = cell[0];
    let key_len = u16::from_le_bytes(cell[1..3].try_into().unwrap()) as usize;
    if cell.len() < 3 + key_len {
        return Err(KuraError::Corruption("leaf cell key truncated".into()));
    }
    let key = &cell[3..3 + key_len];
    let rest = &cell[3 + key_len..];
    match flags {
        LEAF_FLAG_INLINE => Ok((key, LeafValue::Inline(rest))),
        LEAF_FLAG_OVERFLOW => {
            if rest.len() != 8 {
                return Err(KuraError::Corruption("overflow cell truncated".into()));
            }
            let total_len = u32::from_le_bytes(rest[0..4].try_into().unwrap());
            let first_page = u32::from_le_bytes(rest[4..8].try_into().unwrap());
            Ok((
                key,
                LeafValue::Overflow {
                    total_len,
                    first_page,
                },
            ))
        }
        _ => Err(KuraError::Corruption("unknown leaf cell flags".into())),
    }
}

pub fn leaf_key(page: &Page, idx: u16) -> Result<&[u8]> {
    let cell = page
        .cell(idx)
        .ok_or_else(|| KuraError::Corruption(format!("missing leaf cell {}", idx)))?;
    Ok(decode_leaf_cell(cell)?.0)
}

/// Materialize the value at `idx`, following an overflow chain if needed.
pub fn leaf_value_bytes(
    store: &mut impl PageStore,
    page: &Page,
    idx: u16,
) -> Result<Vec<u8>> {
    let cell = page
        .cell(idx)
        .ok_or_else(|| KuraError::Corruption(format!("missing leaf cell {}", idx)))?;
    match decode_leaf_cell(cell)?.1 {
        LeafValue::Inline(v) => Ok(v.to_vec()),
        LeafValue::Overflow {
            total_len,
            first_page,
        } => read_overflow_chain(store, first_page, total_len as usize),
    }
}

// --- Interior cells ---

pub fn encode_interior_cell(child: PageId, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + key.len());
    buf.extend_from_slice(&child.to_le_bytes());
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
    buf
}

pub fn decode_interior_cell(cell: &[u8]) -> Result<(PageId, &[u8])> {
    if cell.len() < 6 {
        return Err(KuraError::Corruption("interior cell truncated".into()));
    }
    let child = u32::from_le_bytes(cell[0..4].try_into().unwrap());
    let key_len = u16::from_le_bytes(cell[4..6].try_into().unwrap()) as usize;
    if cell.len() < 6 + key_len {
        return Err(KuraError::Corruption("interior cell key truncated".into()));
    }
    Ok((child, &cell[6..6 + key_len]))
}

pub fn interior_key(page: &Page, idx: u16) -> Result<&[u8]> {
    let cell = page
        .cell(idx)
        .ok_or_else(|| KuraError::Corruption(format!("missing interior cell {}", idx)))?;
    Ok(decode_interior_cell(cell)?.1)
}

pub fn interior_child(page: &Page, idx: u16) -> Result<PageId> {
    let cell = page
        .cell(idx)
        .ok_or_else(|| KuraError::Corruption(format!("missing interior cell {}", idx)))?;
    Ok(decode_interior_cell(cell)?.0)
}

/// Child to descend into for `key`: the first cell whose separator is
/// greater, else the rightmost child.
pub fn find_child(page: &Page, key: &[u8]) -> Result<(Option<u16>, PageId)> {
    for i in 0..page.cell_count() {
        if key < interior_key(page, i)? {
            return Ok((Some(i), interior_child(page, i)?));
        }
    }
    Ok((None, page.right_ptr()))
}

// --- Underfill ---

/// Minimum fill for non-root pages, in percent of live bytes.
pub const MIN_FILL_PCT: usize = 40;

pub fn is_underfull(page: &Page) -> bool {
    page.live_bytes() * 100 < PAGE_SIZE * MIN_FILL_PCT
}

// --- Overflow chains ---

/// Spill `data` into a chain of overflow pages. Returns the first page id.
pub fn write_overflow_chain(store: &mut impl PageStore, data: &[u8]) -> Result<PageId> {
    let mut chunks: Vec<&[u8]> = data.chunks(OVERFLOW_CHUNK).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    // Build back-to-front so each page can point at its successor.
    let mut next: PageId = 0;
    for chunk in chunks.iter().rev() {
        let mut page = store.allocate_page(PageType::Overflow)?;
        page.set_right_ptr(next);
        let len = chunk.len() as u16;
        page.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 2].copy_from_slice(&len.to_le_bytes());
        page.data[PAGE_HEADER_SIZE + 2..PAGE_HEADER_SIZE + 2 + chunk.len()]
            .copy_from_slice(chunk);
        next = page.id;
        store.write_page(&page)?;
    }
    Ok(next)
}

pub fn read_overflow_chain(
    store: &mut impl PageStore,
    first_page: PageId,
    total_len: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len);
    let mut pid = first_page;
    while pid != 0 {
        let page = store.read_page(pid)?;
        if page.page_type() != Some(PageType::Overflow) {
            return Err(KuraError::Corruption(format!(
                "page {} is not an overflow page",
                pid
            )));
        }
        let len = u16::from_le_bytes(
            page.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 2]
                .try_into()
                .unwrap(),
        ) as usize;
        if len > OVERFLOW_CHUNK {
            return Err(KuraError::Corruption("overflow chunk length invalid".into()));
        }
        out.extend_from_slice(&page.data[PAGE_HEADER_SIZE + 2..PAGE_HEADER_SIZE + 2 + len]);
        pid = page.right_ptr();
        if out.len() > total_len {
            return Err(KuraError::Corruption("overflow chain longer than declared".into()));
        }
    }
    if out.len() != total_len {
        return Err(KuraError::Corruption(format!(
            "overflow chain yielded {} bytes, expected {}",
            out.len(),
            total_len
        )));
    }
    Ok(out)
}

pub fn free_overflow_chain(store: &mut impl PageStore, first_page: PageId) -> Result<()> {
    let mut pid = first_page;
    let mut hops = 0;
    while pid != 0 {
        let page = store.read_page(pid)?;
        let next = page.right_ptr();
        store.free_page(pid);
        pid = next;
        hops += 1;
        if hops > 1_000_000 {
            return Err(KuraError::Corruption("overflow chain cycle".into()));
        }
    }
    Ok(())
}

/// Release any overflow chain referenced by the given leaf cell.
pub fn free_cell_overflow(store: &mut impl PageStore, cell: &[u8]) -> Result<()> {
    if let (_, LeafValue::Overflow { first_page, .. }) = decode_leaf_cell(cell)? {
        free_overflow_chain(store, first_page)?;
    }
    Ok(())
}
