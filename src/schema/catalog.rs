//! System catalog: a B-tree (root recorded in the meta page) mapping
//! `t:<name>` and `i:<name>` keys to serialized definitions.
//!
//! Every non-catalog tree root in the database appears in exactly one
//! catalog row. The handle only carries the root page id; reads go through
//! whatever page store the caller is operating under, so a transaction
//! sees its own uncommitted schema changes.

use crate::btree::ops::BTree;
use crate::engine::row::{decode_row, encode_row};
use crate::error::{KuraError, Result};
use crate::schema::column::{IndexDef, TableDef};
use crate::storage::page::PageId;
use crate::storage::page_store::PageStore;

const TABLE_PREFIX: &[u8] = b"t:";
const INDEX_PREFIX: &[u8] = b"i:";

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PageId,
}

fn table_key(name: &str) -> Vec<u8> {
    let mut key = TABLE_PREFIX.to_vec();
    key.extend_from_slice(name.to_ascii_lowercase().as_bytes());
    key
}

fn index_key(name: &str) -> Vec<u8> {
    let mut key = INDEX_PREFIX.to_vec();
    key.extend_from_slice(name.to_ascii_lowercase().as_bytes());
    key
}

impl Catalog {
    /// Bootstrap the catalog tree in a fresh database.
    pub fn create(store: &mut impl PageStore) -> Result<Self> {
        let tree = BTree::create(store)?;
        Ok(Catalog {
            root: tree.root_page_id(),
        })
    }

    pub fn open(root: PageId) -> Self {
        Catalog { root }
    }

    pub fn root_page_id(&self) -> PageId {
        self.root
    }

    // --- Tables ---

    pub fn create_table(&mut self, store: &mut impl PageStore, def: &TableDef) -> Result<()> {
        let key = table_key(&def.name);
        let mut tree = BTree::open(self.root);
        if tree.lookup(store, &key)?.is_some() {
            return Err(KuraError::Schema(format!(
                "table {} already exists",
                def.name
            )));
        }
        tree.insert(store, &key, &encode_row(&def.to_values()))?;
        self.root = tree.root_page_id();
        Ok(())
    }

    pub fn get_table(&self, store: &mut impl PageStore, name: &str) -> Result<Option<TableDef>> {
        let tree = BTree::open(self.root);
        match tree.lookup(store, &table_key(name))? {
            Some(payload) => Ok(Some(TableDef::from_values(&decode_row(&payload)?)?)),
            None => Ok(None),
        }
    }

    pub fn update_table(&mut self, store: &mut impl PageStore, def: &TableDef) -> Result<()> {
        let mut tree = BTree::open(self.root);
        tree.insert(store, &table_key(&def.name), &encode_row(&def.to_values()))?;
        self.root = tree.root_page_id();
        Ok(())
    }

    pub fn drop_table(&mut self, store: &mut impl PageStore, name: &str) -> Result<bool> {
        let mut tree = BTree::open(self.root);
        let dropped = tree.delete(store, &table_key(name))?;
        self.root = tree.root_page_id();
        Ok(dropped)
    }

    pub fn list_tables(&self, store: &mut impl PageStore) -> Result<Vec<TableDef>> {
        let tree = BTree::open(self.root);
        let mut tables = Vec::new();
        tree.scan(store, |key, value| {
            if key.starts_with(TABLE_PREFIX) {
                tables.push(TableDef::from_values(&decode_row(value)?)?);
            }
            Ok(true)
        })?;
        Ok(tables)
    }

    // --- Indexes ---

    pub fn create_index(&mut self, store: &mut impl PageStore, def: &IndexDef) -> Result<()> {
        let key = index_key(&def.name);
        let mut tree = BTree::open(self.root);
        if tree.lookup(store, &key)?.is_some() {
            return Err(KuraError::Schema(format!(
                "index {} already exists",
                def.name
            )));
        }
        tree.insert(store, &key, &encode_row(&def.to_values()))?;
        self.root = tree.root_page_id();
        Ok(())
    }

    pub fn get_index(&self, store: &mut impl PageStore, name: &str) -> Result<Option<IndexDef>> {
        let tree = BTree::open(self.root);
        match tree.lookup(store, &index_key(name))? {
            Some(payload) => Ok(Some(IndexDef::from_values(&decode_row(&payload)?)?)),
            None => Ok(None),
        }
    }

    pub fn update_index(&mut self, store: &mut impl PageStore, def: &IndexDef) -> Result<()> {
        let mut tree = BTree::open(self.root);
        tree.insert(store, &index_key(&def.name), &encode_row(&def.to_values()))?;
        self.root = tree.root_page_id();
        Ok(())
    }

    pub fn drop_index(&mut self, store: &mut impl PageStore, name: &str) -> Result<bool> {
        let mut tree = BTree::open(self.root);
        let dropped = tree.delete(store, &index_key(name))?;
        self.root = tree.root_page_id();
        Ok(dropped)
    }

    pub fn list_indexes(&self, store: &mut impl PageStore) -> Result<Vec<IndexDef>> {
        let tree = BTree::open(self.root);
        let mut indexes = Vec::new();
        tree.scan(store, |key, value| {
            if key.starts_with(INDEX_PREFIX) {
                indexes.push(IndexDef::from_values(&decode_row(value)?)?);
            }
            Ok(true)
        })?;
        Ok(indexes)
    }

    pub fn indexes_for_table(
        &self,
        store: &mut impl PageStore,
        table: &str,
    ) -> Result<Vec<IndexDef>> {
        Ok(self
            .list_indexes(store)?
            .into_iter()
            .filter(|idx| idx.table.eq_ignore_ascii_case(table))
            .collect())
    }
}
