//! Streaming B-tree cursor.
//!
//! A cursor does not own its page: it holds `(leaf pid + pin, slot hint,
//! last emitted key)`. The pin keeps the frame cache-resident between
//! advances. After any structural change made by its own statement
//! (`invalidate`), or whenever the parked leaf no longer looks right, the
//! cursor re-seeks from the root to the first key strictly greater than
//! the last one it emitted, so iteration survives splits, merges and
//! eviction.

use crate::btree::key_encoding::compare_keys;
use crate::btree::node::{leaf_key, leaf_value_bytes};
use crate::btree::ops::BTree;
use crate::error::Result;
use crate::storage::page::{PageId, PageType};
use crate::storage::page_store::PageStore;

pub struct BTreeCursor {
    root: PageId,
    /// Start bound for the first positioning (inclusive).
    start: Option<Vec<u8>>,
    /// Exclusive-upper / inclusive-upper bound.
    upper: Option<(Vec<u8>, bool)>,
    leaf: Option<PageId>,
    slot: u16,
    last_key: Option<Vec<u8>>,
    done: bool,
}

impl BTreeCursor {
    /// Cursor over the whole tree.
    pub fn scan_all(tree: &BTree) -> Self {
        BTreeCursor {
            root: tree.root_page_id(),
            start: None,
            upper: None,
            leaf: None,
            slot: 0,
            last_key: None,
            done: false,
        }
    }

    /// Cursor over keys >= `start`.
    pub fn scan_from(tree: &BTree, start: Vec<u8>) -> Self {
        BTreeCursor {
            root: tree.root_page_id(),
            start: Some(start),
            upper: None,
            leaf: None,
            slot: 0,
            last_key: None,
            done: false,
        }
    }

    /// Stop before keys greater than `upper` (inclusive bound) or at
    /// `upper` (exclusive bound).
    pub fn with_upper(mut self, upper: Vec<u8>, inclusive: bool) -> Self {
        self.upper = Some((upper, inclusive));
        self
    }

    /// Drop the parked position. The next advance re-seeks from the root;
    /// callers invoke this after mutating the tree mid-scan.
    pub fn invalidate(&mut self, store: &mut impl PageStore) {
        if let Some(pid) = self.leaf.take() {
            store.unpin(pid);
        }
    }

    /// Point the cursor at a (possibly new) root after a structural change.
    pub fn set_root(&mut self, root: PageId) {
        self.root = root;
    }

    /// Release the leaf pin. The cursor is unusable afterwards.
    pub fn close(&mut self, store: &mut impl PageStore) {
        self.invalidate(store);
        self.done = true;
    }

    /// Advance and return the next entry in key order.
    pub fn next(&mut self, store: &mut impl PageStore) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }

        loop {
            let pid = match self.leaf {
                Some(pid) => pid,
                None => {
                    // (Re-)position: strictly after last_key, else at start.
                    let seek = self.last_key.as_deref().or(self.start.as_deref());
                    let tree = BTree::open(self.root);
                    let pid = tree.find_leaf(store, seek)?;
                    store.pin(pid);
                    self.leaf = Some(pid);
                    self.slot = 0;
                    pid
                }
            };

            let page = store.read_page(pid)?;
            if page.page_type() != Some(PageType::Leaf) {
                // The parked page was repurposed under us; re-seek.
                store.unpin(pid);
                self.leaf = None;
                continue;
            }

            // Find the first slot past the last emitted key (or at/after the
            // start bound). The slot hint is trusted only when the cell
            // before it still holds the last emitted key.
            let n = page.cell_count();
            let mut found: Option<u16> = None;
            let hint_valid = match (&self.last_key, self.slot) {
                (Some(last), s) if s > 0 && s <= n => {
                    leaf_key(&page, s - 1).map(|k| k == last.as_slice()).unwrap_or(false)
                }
                _ => false,
            };
            let mut i = if hint_valid { self.slot } else { 0 };
            while i < n {
                let key = leaf_key(&page, i)?;
                let usable = match (&self.last_key, &self.start) {
                    (Some(last), _) => compare_keys(key, last) == std::cmp::Ordering::Greater,
                    (None, Some(start)) => compare_keys(key, start) != std::cmp::Ordering::Less,
                    (None, None) => true,
                };
                if usable {
                    found = Some(i);
                    break;
                }
                i += 1;
            }

            match found {
                Some(slot) => {
                    let key = leaf_key(&page, slot)?.to_vec();
                    if let Some((upper, inclusive)) = &self.upper {
                        let past = match compare_keys(&key, upper) {
                            std::cmp::Ordering::Greater => true,
                            std::cmp::Ordering::Equal => !inclusive,
                            std::cmp::Ordering::Less => false,
                        };
                        if past {
                            self.close(store);
                            return Ok(None);
                        }
                    }
                    let value = leaf_value_bytes(store, &page, slot)?;
                    self.slot = slot + 1;
                    self.last_key = Some(key.clone());
                    return Ok(Some((key, value)));
                }
                None => {
                    // Exhausted this leaf; follow the sibling chain.
                    let next = page.right_ptr();
                    store.unpin(pid);
                    if next == 0 {
                        self.leaf = None;
                        self.done = true;
                        return Ok(None);
                    }
                    store.pin(next);
                    self.leaf = Some(next);
                    self.slot = 0;
                }
            }
        }
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }
}
