//! B+-tree operations: lookup, insert (with median split), delete (with
//! borrow/merge rebalance), ordered scans.
//!
//! Pages are rebuilt rather than patched in place: operations collect the
//! affected cells, perform list surgery, and write fresh page images
//! through the page store. Leaf pages are linked through `right_ptr`;
//! splits and merges maintain the chain.

use crate::btree::key_encoding::compare_keys;
use crate::btree::node::*;
use crate::error::{KuraError, Result};
use crate::storage::page::{
    Page, PageId, PageType, CELL_HEADER_SIZE, CELL_POINTER_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE,
};
use crate::storage::page_store::PageStore;

/// Maximum depth guard against cycles in a corrupted tree.
const MAX_BTREE_DEPTH: usize = 64;

/// B-tree handle. Tracks the root page; the caller persists root changes.
pub struct BTree {
    root: PageId,
}

struct SplitResult {
    separator: Vec<u8>,
    right_page_id: PageId,
}

fn depth_guard(depth: usize) -> Result<()> {
    if depth > MAX_BTREE_DEPTH {
        return Err(KuraError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ));
    }
    Ok(())
}

fn cells_fit(cells: &[Vec<u8>]) -> bool {
    let total: usize = cells
        .iter()
        .map(|c| c.len() + CELL_POINTER_SIZE + CELL_HEADER_SIZE)
        .sum();
    PAGE_HEADER_SIZE + total <= PAGE_SIZE
}

/// Split index by accumulated bytes, clamped to [1, len-1].
fn split_point(cells: &[Vec<u8>]) -> usize {
    let total: usize = cells.iter().map(|c| c.len() + 4).sum();
    let mut acc = 0usize;
    for (i, cell) in cells.iter().enumerate() {
        acc += cell.len() + 4;
        if acc * 2 >= total {
            return (i + 1).clamp(1, cells.len() - 1);
        }
    }
    (cells.len() / 2).max(1)
}

fn collect_cells(page: &Page) -> Vec<Vec<u8>> {
    (0..page.cell_count())
        .filter_map(|i| page.cell(i).map(|c| c.to_vec()))
        .collect()
}

fn rebuild(pid: PageId, page_type: PageType, right_ptr: PageId, cells: &[Vec<u8>]) -> Result<Page> {
    let mut page = Page::new(pid, page_type);
    page.set_right_ptr(right_ptr);
    for cell in cells {
        page.push_cell(cell)?;
    }
    Ok(page)
}

/// First slot whose key is >= `key`, and whether it is an exact match.
fn leaf_find_slot(page: &Page, key: &[u8]) -> Result<(u16, bool)> {
    let n = page.cell_count();
    for i in 0..n {
        match compare_keys(key, leaf_key(page, i)?) {
            std::cmp::Ordering::Equal => return Ok((i, true)),
            std::cmp::Ordering::Less => return Ok((i, false)),
            std::cmp::Ordering::Greater => continue,
        }
    }
    Ok((n, false))
}

impl BTree {
    /// Create a new B-tree with a fresh root leaf page.
    pub fn create(store: &mut impl PageStore) -> Result<Self> {
        let root = store.allocate_page(PageType::Leaf)?;
        let root_id = root.id;
        store.write_page(&root)?;
        Ok(BTree { root: root_id })
    }

    pub fn open(root: PageId) -> Self {
        BTree { root }
    }

    pub fn root_page_id(&self) -> PageId {
        self.root
    }

    // --- Lookup ---

    pub fn lookup(&self, store: &mut impl PageStore, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut pid = self.root;
        for depth in 0.. {
            depth_guard(depth)?;
            let page = store.read_page(pid)?;
            match page.page_type() {
                Some(PageType::Leaf) => {
                    let (slot, exact) = leaf_find_slot(&page, key)?;
                    if !exact {
                        return Ok(None);
                    }
                    return leaf_value_bytes(store, &page, slot).map(Some);
                }
                Some(PageType::Interior) => {
                    pid = find_child(&page, key)?.1;
                }
                _ => return Err(KuraError::Corruption(format!("page {} is not a B-tree page", pid))),
            }
        }
        unreachable!()
    }

    /// Leaf page that would contain `key` (leftmost leaf when None).
    pub fn find_leaf(&self, store: &mut impl PageStore, key: Option<&[u8]>) -> Result<PageId> {
        let mut pid = self.root;
        for depth in 0.. {
            depth_guard(depth)?;
            let page = store.read_page(pid)?;
            match page.page_type() {
                Some(PageType::Leaf) => return Ok(pid),
                Some(PageType::Interior) => {
                    pid = match key {
                        Some(k) => find_child(&page, k)?.1,
                        None => {
                            if page.cell_count() > 0 {
                                interior_child(&page, 0)?
                            } else {
                                page.right_ptr()
                            }
                        }
                    };
                }
                _ => return Err(KuraError::Corruption(format!("page {} is not a B-tree page", pid))),
            }
        }
        unreachable!()
    }

    // --- Insert ---

    /// Insert a key/value pair; an existing key has its value replaced.
    /// Values above the inline threshold spill to an overflow chain.
    pub fn insert(&mut self, store: &mut impl PageStore, key: &[u8], value: &[u8]) -> Result<()> {
        let cell = if value.len() > MAX_INLINE_VALUE {
            let first = write_overflow_chain(store, value)?;
            encode_leaf_overflow(key, value.len() as u32, first)
        } else {
            encode_leaf_inline(key, value)
        };

        if let Some(split) = self.insert_into_page(store, self.root, key, &cell, 0)? {
            // Root split: grow the tree by one level.
            let mut new_root = store.allocate_page(PageType::Interior)?;
            new_root.set_right_ptr(split.right_page_id);
            new_root.push_cell(&encode_interior_cell(self.root, &split.separator))?;
            store.write_page(&new_root)?;
            self.root = new_root.id;
        }
        Ok(())
    }

    fn insert_into_page(
        &mut self,
        store: &mut impl PageStore,
        pid: PageId,
        key: &[u8],
        cell: &[u8],
        depth: usize,
    ) -> Result<Option<SplitResult>> {
        depth_guard(depth)?;
        let page = store.read_page(pid)?;
        match page.page_type() {
            Some(PageType::Leaf) => self.insert_into_leaf(store, page, key, cell),
            Some(PageType::Interior) => {
                let (child_slot, child) = find_child(&page, key)?;
                match self.insert_into_page(store, child, key, cell, depth + 1)? {
                    Some(split) => self.insert_into_interior(store, page, child_slot, child, split),
                    None => Ok(None),
                }
            }
            _ => Err(KuraError::Corruption(format!("page {} is not a B-tree page", pid))),
        }
    }

    fn insert_into_leaf(
        &self,
        store: &mut impl PageStore,
        page: Page,
        key: &[u8],
        cell: &[u8],
    ) -> Result<Option<SplitResult>> {
        let mut page = page;
        let (slot, exact) = leaf_find_slot(&page, key)?;
        if exact {
            // Replace: release the old value's overflow chain first.
            let old = page
                .cell(slot)
                .ok_or_else(|| KuraError::Internal("leaf slot vanished".into()))?
                .to_vec();
            free_cell_overflow(store, &old)?;
            page.remove_cell(slot);
        }

        if page.fits(cell.len()) {
            page.insert_cell_at(slot, cell)?;
            store.write_page(&page)?;
            return Ok(None);
        }

        // Split at the byte midpoint; the right half's first key separates.
        let mut cells = collect_cells(&page);
        cells.insert(slot as usize, cell.to_vec());
        if cells.len() < 2 {
            return Err(KuraError::Internal("split of a single-cell leaf".into()));
        }
        let mid = split_point(&cells);
        let (separator, _) = decode_leaf_cell(&cells[mid]).map(|(k, v)| (k.to_vec(), v))?;

        let mut right = store.allocate_page(PageType::Leaf)?;
        let right_id = right.id;
        right.set_right_ptr(page.right_ptr());
        for c in &cells[mid..] {
            right.push_cell(c)?;
        }
        let left = rebuild(page.id, PageType::Leaf, right_id, &cells[..mid])?;

        store.write_page(&left)?;
        store.write_page(&right)?;
        Ok(Some(SplitResult {
            separator,
            right_page_id: right_id,
        }))
    }

    fn insert_into_interior(
        &self,
        store: &mut impl PageStore,
        page: Page,
        child_slot: Option<u16>,
        child: PageId,
        split: SplitResult,
    ) -> Result<Option<SplitResult>> {
        let mut cells = collect_cells(&page);
        let mut right_ptr = page.right_ptr();

        match child_slot {
            Some(i) => {
                // The split child keeps its slot's separator but moves to the
                // new right half; the left half gets the split separator.
                let i = i as usize;
                let (old_child, old_sep) = decode_interior_cell(&cells[i])
                    .map(|(c, s)| (c, s.to_vec()))?;
                if old_child != child {
                    return Err(KuraError::Corruption(
                        "interior cell child pointer drifted".into(),
                    ));
                }
                cells[i] = encode_interior_cell(split.right_page_id, &old_sep);
                cells.insert(i, encode_interior_cell(child, &split.separator));
            }
            None => {
                cells.push(encode_interior_cell(child, &split.separator));
                right_ptr = split.right_page_id;
            }
        }

        if cells_fit(&cells) {
            let rebuilt = rebuild(page.id, PageType::Interior, right_ptr, &cells)?;
            store.write_page(&rebuilt)?;
            return Ok(None);
        }

        // Split this interior node; the midpoint separator moves up.
        let mid = split_point(&cells).min(cells.len() - 2).max(1);
        let (mid_child, mid_sep) =
            decode_interior_cell(&cells[mid]).map(|(c, s)| (c, s.to_vec()))?;

        let left = rebuild(page.id, PageType::Interior, mid_child, &cells[..mid])?;
        let mut right = store.allocate_page(PageType::Interior)?;
        let right_id = right.id;
        right.set_right_ptr(right_ptr);
        for c in &cells[mid + 1..] {
            right.push_cell(c)?;
        }

        store.write_page(&left)?;
        store.write_page(&right)?;
        Ok(Some(SplitResult {
            separator: mid_sep,
            right_page_id: right_id,
        }))
    }

    // --- Delete ---

    /// Delete a key. Returns true if it was present.
    pub fn delete(&mut self, store: &mut impl PageStore, key: &[u8]) -> Result<bool> {
        let (deleted, _) = self.delete_from_page(store, self.root, key, 0)?;

        if deleted {
            // Collapse an empty interior root onto its single child.
            let root = store.read_page(self.root)?;
            if root.page_type() == Some(PageType::Interior) && root.cell_count() == 0 {
                let child = root.right_ptr();
                store.free_page(self.root);
                self.root = child;
            }
        }
        Ok(deleted)
    }

    /// Returns (deleted, child is underfull).
    fn delete_from_page(
        &mut self,
        store: &mut impl PageStore,
        pid: PageId,
        key: &[u8],
        depth: usize,
    ) -> Result<(bool, bool)> {
        depth_guard(depth)?;
        let page = store.read_page(pid)?;
        match page.page_type() {
            Some(PageType::Leaf) => {
                let mut page = page;
                let (slot, exact) = leaf_find_slot(&page, key)?;
                if !exact {
                    return Ok((false, false));
                }
                let cell = page
                    .cell(slot)
                    .ok_or_else(|| KuraError::Internal("leaf slot vanished".into()))?
                    .to_vec();
                free_cell_overflow(store, &cell)?;
                page.remove_cell(slot);
                let underfull = is_underfull(&page);
                store.write_page(&page)?;
                Ok((true, underfull))
            }
            Some(PageType::Interior) => {
                let (child_slot, child) = find_child(&page, key)?;
                let (deleted, underfull) = self.delete_from_page(store, child, key, depth + 1)?;
                if deleted && underfull {
                    self.rebalance_child(store, pid, child_slot)?;
                }
                let page = store.read_page(pid)?;
                Ok((deleted, is_underfull(&page)))
            }
            _ => Err(KuraError::Corruption(format!("page {} is not a B-tree page", pid))),
        }
    }

    /// Fix an underfull child: borrow from (redistribute with) an adjacent
    /// sibling when the combined content is too large for one page,
    /// otherwise merge the pair and drop the separator from the parent.
    fn rebalance_child(
        &mut self,
        store: &mut impl PageStore,
        parent_pid: PageId,
        child_slot: Option<u16>,
    ) -> Result<()> {
        let parent = store.read_page(parent_pid)?;
        let n = parent.cell_count();
        if n == 0 {
            return Ok(()); // single child, nothing to pair with
        }

        // Pick the adjacent pair (left, right) and the separator between
        // them: cell `sep_idx` points at `left`.
        let sep_idx: u16 = match child_slot {
            Some(0) => 0,
            Some(i) => i - 1,
            None => n - 1,
        };
        let left_pid = interior_child(&parent, sep_idx)?;
        let right_pid = if sep_idx + 1 < n {
            interior_child(&parent, sep_idx + 1)?
        } else {
            parent.right_ptr()
        };

        let left = store.read_page(left_pid)?;
        let right = store.read_page(right_pid)?;

        match (left.page_type(), right.page_type()) {
            (Some(PageType::Leaf), Some(PageType::Leaf)) => {
                self.rebalance_leaves(store, parent, sep_idx, left, right)
            }
            (Some(PageType::Interior), Some(PageType::Interior)) => {
                self.rebalance_interiors(store, parent, sep_idx, left, right)
            }
            _ => Err(KuraError::Corruption(
                "sibling pages at different levels".into(),
            )),
        }
    }

    fn rebalance_leaves(
        &mut self,
        store: &mut impl PageStore,
        parent: Page,
        sep_idx: u16,
        left: Page,
        right: Page,
    ) -> Result<()> {
        let mut cells = collect_cells(&left);
        cells.extend(collect_cells(&right));

        if cells_fit(&cells) {
            // Merge into the left page; unlink the right sibling.
            let merged = rebuild(left.id, PageType::Leaf, right.right_ptr(), &cells)?;
            store.write_page(&merged)?;
            store.free_page(right.id);
            self.remove_parent_separator(store, parent, sep_idx, left.id, right.id)
        } else {
            // Redistribute around the byte midpoint; the new separator is
            // the right half's first key.
            let mid = split_point(&cells);
            let separator = decode_leaf_cell(&cells[mid])?.0.to_vec();
            let new_left = rebuild(left.id, PageType::Leaf, right.id, &cells[..mid])?;
            let new_right = rebuild(right.id, PageType::Leaf, right.right_ptr(), &cells[mid..])?;
            store.write_page(&new_left)?;
            store.write_page(&new_right)?;
            self.replace_parent_separator(store, parent, sep_idx, left.id, &separator)
        }
    }

    fn rebalance_interiors(
        &mut self,
        store: &mut impl PageStore,
        parent: Page,
        sep_idx: u16,
        left: Page,
        right: Page,
    ) -> Result<()> {
        let pulled = interior_key(&parent, sep_idx)?.to_vec();

        let mut cells = collect_cells(&left);
        cells.push(encode_interior_cell(left.right_ptr(), &pulled));
        cells.extend(collect_cells(&right));
        let combined_right = right.right_ptr();

        if cells_fit(&cells) {
            let merged = rebuild(left.id, PageType::Interior, combined_right, &cells)?;
            store.write_page(&merged)?;
            store.free_page(right.id);
            self.remove_parent_separator(store, parent, sep_idx, left.id, right.id)
        } else {
            let mid = split_point(&cells).min(cells.len() - 2).max(1);
            let (mid_child, mid_sep) =
                decode_interior_cell(&cells[mid]).map(|(c, s)| (c, s.to_vec()))?;
            let new_left = rebuild(left.id, PageType::Interior, mid_child, &cells[..mid])?;
            let new_right =
                rebuild(right.id, PageType::Interior, combined_right, &cells[mid + 1..])?;
            store.write_page(&new_left)?;
            store.write_page(&new_right)?;
            self.replace_parent_separator(store, parent, sep_idx, left.id, &mid_sep)
        }
    }

    /// After a merge: drop cell `sep_idx` and point the following child slot
    /// (or the rightmost pointer) at the merged page.
    fn remove_parent_separator(
        &mut self,
        store: &mut impl PageStore,
        parent: Page,
        sep_idx: u16,
        left_pid: PageId,
        right_pid: PageId,
    ) -> Result<()> {
        let mut cells = collect_cells(&parent);
        let mut right_ptr = parent.right_ptr();

        cells.remove(sep_idx as usize);
        let idx = sep_idx as usize;
        if idx < cells.len() {
            let (c, s) = decode_interior_cell(&cells[idx]).map(|(c, s)| (c, s.to_vec()))?;
            if c != right_pid {
                return Err(KuraError::Corruption(
                    "parent child pointer drifted during merge".into(),
                ));
            }
            cells[idx] = encode_interior_cell(left_pid, &s);
        } else {
            if right_ptr != right_pid {
                return Err(KuraError::Corruption(
                    "parent rightmost pointer drifted during merge".into(),
                ));
            }
            right_ptr = left_pid;
        }

        let rebuilt = rebuild(parent.id, PageType::Interior, right_ptr, &cells)?;
        store.write_page(&rebuilt)
    }

    /// After a redistribution: swap in the new separator for the pair.
    fn replace_parent_separator(
        &mut self,
        store: &mut impl PageStore,
        parent: Page,
        sep_idx: u16,
        left_pid: PageId,
        separator: &[u8],
    ) -> Result<()> {
        let mut cells = collect_cells(&parent);
        cells[sep_idx as usize] = encode_interior_cell(left_pid, separator);
        let rebuilt = rebuild(parent.id, PageType::Interior, parent.right_ptr(), &cells)?;
        store.write_page(&rebuilt)
    }

    // --- Scans ---

    /// Iterate all entries in key order. The callback returns false to stop.
    pub fn scan<F>(&self, store: &mut impl PageStore, mut callback: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        self.scan_from(store, None, &mut callback)
    }

    /// Iterate entries with key >= `start` (all entries when None),
    /// following the leaf sibling chain.
    pub fn scan_from<F>(
        &self,
        store: &mut impl PageStore,
        start: Option<&[u8]>,
        callback: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let mut pid = self.find_leaf(store, start)?;
        let mut visited = std::collections::HashSet::new();
        loop {
            if !visited.insert(pid) {
                return Err(KuraError::Corruption(format!(
                    "leaf chain cycle at page {}",
                    pid
                )));
            }
            let page = store.read_page(pid)?;
            if page.page_type() != Some(PageType::Leaf) {
                return Err(KuraError::Corruption(format!(
                    "leaf chain reached non-leaf page {}",
                    pid
                )));
            }
            for i in 0..page.cell_count() {
                let key = leaf_key(&page, i)?.to_vec();
                if let Some(s) = start {
                    if compare_keys(&key, s) == std::cmp::Ordering::Less {
                        continue;
                    }
                }
                let value = leaf_value_bytes(store, &page, i)?;
                if !callback(&key, &value)? {
                    return Ok(());
                }
            }
            pid = page.right_ptr();
            if pid == 0 {
                return Ok(());
            }
        }
    }

    /// All pages reachable from the root, overflow chains included
    /// (used when dropping a tree).
    pub fn collect_all_pages(&self, store: &mut impl PageStore) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut visited = std::collections::HashSet::new();
        self.collect_pages(store, self.root, &mut pages, &mut visited, 0)?;
        Ok(pages)
    }

    fn collect_pages(
        &self,
        store: &mut impl PageStore,
        pid: PageId,
        pages: &mut Vec<PageId>,
        visited: &mut std::collections::HashSet<PageId>,
        depth: usize,
    ) -> Result<()> {
        depth_guard(depth)?;
        if !visited.insert(pid) {
            return Err(KuraError::Corruption(format!(
                "B-tree cycle detected at page {}",
                pid
            )));
        }
        pages.push(pid);
        let page = store.read_page(pid)?;
        match page.page_type() {
            Some(PageType::Leaf) => {
                for i in 0..page.cell_count() {
                    let cell = page.cell(i).unwrap_or_default();
                    if let (_, LeafValue::Overflow { first_page, .. }) = decode_leaf_cell(cell)? {
                        let mut opid = first_page;
                        while opid != 0 {
                            if !visited.insert(opid) {
                                return Err(KuraError::Corruption(
                                    "overflow chain cycle".into(),
                                ));
                            }
                            pages.push(opid);
                            opid = store.read_page(opid)?.right_ptr();
                        }
                    }
                }
                Ok(())
            }
            Some(PageType::Interior) => {
                for i in 0..page.cell_count() {
                    let child = interior_child(&page, i)?;
                    self.collect_pages(store, child, pages, visited, depth + 1)?;
                }
                self.collect_pages(store, page.right_ptr(), pages, visited, depth + 1)
            }
            _ => Err(KuraError::Corruption(format!("page {} is not a B-tree page", pid))),
        }
    }
}

#[cfg(test)]
mod tests;
