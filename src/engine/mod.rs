//! Storage engine: tables and secondary indexes over B-trees.
//!
//! A `Table` handle couples a table definition with its index definitions
//! and keeps the catalog in sync when tree roots move or the rowid counter
//! advances. Rows are addressed by a signed rowid; a table declaring an
//! INTEGER PRIMARY KEY uses that column as the rowid, otherwise rowids are
//! assigned monotonically.

pub mod row;

use crate::btree::cursor::BTreeCursor;
use crate::btree::key_encoding::{encode_index_key, encode_index_prefix, encode_rowid};
use crate::btree::ops::BTree;
use crate::engine::row::{decode_row, encode_row};
use crate::error::{KuraError, Result};
use crate::schema::catalog::Catalog;
use crate::schema::column::{ColumnDef, IndexDef, TableDef};
use crate::storage::page_store::PageStore;
use crate::types::{DataType, Value};

pub struct Table {
    pub def: TableDef,
    indexes: Vec<IndexDef>,
}

/// Engine-level statistics (CLI `.stats`).
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub table_count: usize,
    pub index_count: usize,
    pub page_count: u32,
    pub cached_pages: usize,
    pub cache_hit_ratio: f64,
}

impl Table {
    pub fn open(store: &mut impl PageStore, catalog: &Catalog, name: &str) -> Result<Table> {
        let def = catalog
            .get_table(store, name)?
            .ok_or_else(|| KuraError::Schema(format!("no such table: {}", name)))?;
        let indexes = catalog.indexes_for_table(store, name)?;
        Ok(Table { def, indexes })
    }

    fn check_row(&self, values: &[Value]) -> Result<()> {
        if values.len() != self.def.columns.len() {
            return Err(KuraError::Schema(format!(
                "table {} has {} columns but {} values were supplied",
                self.def.name,
                self.def.columns.len(),
                values.len()
            )));
        }
        for (value, col) in values.iter().zip(&self.def.columns) {
            check_column_type(value, col)?;
        }
        Ok(())
    }

    /// Insert a row, returning its rowid.
    pub fn insert_row(
        &mut self,
        store: &mut impl PageStore,
        catalog: &mut Catalog,
        mut values: Vec<Value>,
    ) -> Result<i64> {
        coerce_row(&mut values, &self.def.columns);
        self.check_row(&values)?;

        let mut tree = BTree::open(self.def.root);

        let rowid = match self.def.rowid_pk {
            Some(pk_idx) => match &values[pk_idx] {
                Value::Integer(v) => {
                    let v = *v;
                    if tree.lookup(store, &encode_rowid(v))?.is_some() {
                        return Err(KuraError::Schema(format!(
                            "UNIQUE constraint failed: {}.{}",
                            self.def.name, self.def.columns[pk_idx].name
                        )));
                    }
                    v
                }
                Value::Null => {
                    let v = self.def.next_rowid;
                    values[pk_idx] = Value::Integer(v);
                    v
                }
                _ => {
                    return Err(KuraError::Schema(format!(
                        "{}.{} must be an integer",
                        self.def.name, self.def.columns[pk_idx].name
                    )))
                }
            },
            None => self.def.next_rowid,
        };

        // Unique index checks before any mutation.
        for idx in &self.indexes {
            if idx.unique && !values[idx.column].is_null() {
                let index_tree = BTree::open(idx.root);
                if index_has_value(&index_tree, store, &values[idx.column])? {
                    return Err(KuraError::Schema(format!(
                        "UNIQUE constraint failed: {}.{}",
                        self.def.name, self.def.columns[idx.column].name
                    )));
                }
            }
        }

        tree.insert(store, &encode_rowid(rowid), &encode_row(&values))?;
        self.def.root = tree.root_page_id();
        self.def.next_rowid = self.def.next_rowid.max(rowid.saturating_add(1));

        for i in 0..self.indexes.len() {
            let key = encode_index_key(&values[self.indexes[i].column], rowid)?;
            let mut index_tree = BTree::open(self.indexes[i].root);
            index_tree.insert(store, &key, &rowid.to_le_bytes())?;
            if index_tree.root_page_id() != self.indexes[i].root {
                self.indexes[i].root = index_tree.root_page_id();
                catalog.update_index(store, &self.indexes[i])?;
            }
        }

        catalog.update_table(store, &self.def)?;
        Ok(rowid)
    }

    pub fn lookup_pk(
        &self,
        store: &mut impl PageStore,
        rowid: i64,
    ) -> Result<Option<Vec<Value>>> {
        let tree = BTree::open(self.def.root);
        match tree.lookup(store, &encode_rowid(rowid))? {
            Some(payload) => Ok(Some(decode_row(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn update_row(
        &mut self,
        store: &mut impl PageStore,
        catalog: &mut Catalog,
        rowid: i64,
        mut values: Vec<Value>,
    ) -> Result<()> {
        coerce_row(&mut values, &self.def.columns);
        self.check_row(&values)?;

        let old = self.lookup_pk(store, rowid)?.ok_or_else(|| {
            KuraError::Internal(format!("update of missing rowid {}", rowid))
        })?;

        // A changed INTEGER PRIMARY KEY moves the row to a new rowid.
        if let Some(pk_idx) = self.def.rowid_pk {
            let new_rowid = match &values[pk_idx] {
                Value::Integer(v) => *v,
                Value::Null => {
                    return Err(KuraError::Schema(format!(
                        "{}.{} may not be NULL",
                        self.def.name, self.def.columns[pk_idx].name
                    )))
                }
                _ => {
                    return Err(KuraError::Schema(format!(
                        "{}.{} must be an integer",
                        self.def.name, self.def.columns[pk_idx].name
                    )))
                }
            };
            if new_rowid != rowid {
                self.delete_row(store, catalog, rowid)?;
                self.insert_row(store, catalog, values)?;
                return Ok(());
            }
        }

        // Unique checks for indexed columns that change value.
        for idx in &self.indexes {
            if idx.unique
                && !values[idx.column].is_null()
                && values[idx.column] != old[idx.column]
            {
                let index_tree = BTree::open(idx.root);
                if index_has_value(&index_tree, store, &values[idx.column])? {
                    return Err(KuraError::Schema(format!(
                        "UNIQUE constraint failed: {}.{}",
                        self.def.name, self.def.columns[idx.column].name
                    )));
                }
            }
        }

        let mut tree = BTree::open(self.def.root);
        tree.insert(store, &encode_rowid(rowid), &encode_row(&values))?;
        self.def.root = tree.root_page_id();

        for i in 0..self.indexes.len() {
            let idx = self.indexes[i].clone();
            if values[idx.column] == old[idx.column] {
                continue;
            }
            let mut index_tree = BTree::open(idx.root);
            index_tree.delete(store, &encode_index_key(&old[idx.column], rowid)?)?;
            index_tree.insert(
                store,
                &encode_index_key(&values[idx.column], rowid)?,
                &rowid.to_le_bytes(),
            )?;
            if index_tree.root_page_id() != idx.root {
                self.indexes[i].root = index_tree.root_page_id();
                catalog.update_index(store, &self.indexes[i])?;
            }
        }

        catalog.update_table(store, &self.def)?;
        Ok(())
    }

    pub fn delete_row(
        &mut self,
        store: &mut impl PageStore,
        catalog: &mut Catalog,
        rowid: i64,
    ) -> Result<bool> {
        let Some(old) = self.lookup_pk(store, rowid)? else {
            return Ok(false);
        };

        let mut tree = BTree::open(self.def.root);
        tree.delete(store, &encode_rowid(rowid))?;
        self.def.root = tree.root_page_id();

        for i in 0..self.indexes.len() {
            let idx = self.indexes[i].clone();
            let mut index_tree = BTree::open(idx.root);
            index_tree.delete(store, &encode_index_key(&old[idx.column], rowid)?)?;
            if index_tree.root_page_id() != idx.root {
                self.indexes[i].root = index_tree.root_page_id();
                catalog.update_index(store, &self.indexes[i])?;
            }
        }

        catalog.update_table(store, &self.def)?;
        Ok(true)
    }

    /// Cursor over the whole table in rowid order.
    pub fn scan(&self) -> TableCursor {
        TableCursor {
            cursor: BTreeCursor::scan_all(&BTree::open(self.def.root)),
        }
    }

    /// Cursor positioned at one rowid (PK point lookup).
    pub fn seek_pk(&self, rowid: i64) -> TableCursor {
        let key = encode_rowid(rowid).to_vec();
        TableCursor {
            cursor: BTreeCursor::scan_from(&BTree::open(self.def.root), key.clone())
                .with_upper(key, true),
        }
    }
}

pub struct TableCursor {
    cursor: BTreeCursor,
}

impl TableCursor {
    pub fn next(&mut self, store: &mut impl PageStore) -> Result<Option<(i64, Vec<Value>)>> {
        match self.cursor.next(store)? {
            Some((key, payload)) => {
                let rowid = crate::btree::key_encoding::decode_rowid(&key)?;
                Ok(Some((rowid, decode_row(&payload)?)))
            }
            None => Ok(None),
        }
    }

    /// Forget the parked position after a structural change; the next
    /// advance re-seeks past the last emitted row.
    pub fn invalidate(&mut self, store: &mut impl PageStore) {
        self.cursor.invalidate(store);
    }

    /// Follow a root change made by this statement's own writes.
    pub fn reroot(&mut self, root: crate::storage::page::PageId) {
        self.cursor.set_root(root);
    }

    pub fn close(&mut self, store: &mut impl PageStore) {
        self.cursor.close(store);
    }
}

/// True when any index entry carries exactly this value.
fn index_has_value(tree: &BTree, store: &mut impl PageStore, value: &Value) -> Result<bool> {
    let prefix = encode_index_prefix(value)?;
    let mut cursor = BTreeCursor::scan_from(tree, prefix.clone());
    let found = match cursor.next(store)? {
        Some((key, _)) => key.starts_with(&prefix),
        None => false,
    };
    cursor.close(store);
    Ok(found)
}

fn check_column_type(value: &Value, col: &ColumnDef) -> Result<()> {
    if value.is_null() {
        if col.not_null || col.primary_key {
            // A NULL INTEGER PRIMARY KEY is auto-assigned upstream.
            if !(col.primary_key && col.data_type == DataType::Integer) {
                return Err(KuraError::Schema(format!(
                    "{} may not be NULL",
                    col.name
                )));
            }
        }
        return Ok(());
    }
    let ok = matches!(
        (value.data_type(), col.data_type),
        (Some(DataType::Integer), DataType::Integer)
            | (Some(DataType::Real), DataType::Real)
            | (Some(DataType::Text), DataType::Text)
            | (Some(DataType::Blob), DataType::Blob)
    );
    if !ok {
        return Err(KuraError::Schema(format!(
            "type mismatch for column {}: expected {}",
            col.name, col.data_type
        )));
    }
    Ok(())
}

/// Integer literals flow into REAL columns as reals.
fn coerce_row(values: &mut [Value], columns: &[ColumnDef]) {
    for (value, col) in values.iter_mut().zip(columns) {
        if col.data_type == DataType::Real {
            if let Value::Integer(v) = value {
                *value = Value::Real(*v as f64);
            }
        }
    }
}

// --- DDL entry points ---

/// Create a table: fresh tree, catalog row, plus a unique index for a
/// non-INTEGER PRIMARY KEY column (which cannot be the rowid).
pub fn create_table(
    store: &mut impl PageStore,
    catalog: &mut Catalog,
    name: &str,
    columns: Vec<ColumnDef>,
) -> Result<()> {
    let pk_cols: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.primary_key)
        .map(|(i, _)| i)
        .collect();
    if pk_cols.len() > 1 {
        return Err(KuraError::Schema("multiple PRIMARY KEY columns".into()));
    }
    let mut names = std::collections::HashSet::new();
    for col in &columns {
        if !names.insert(col.name.to_ascii_lowercase()) {
            return Err(KuraError::Schema(format!(
                "duplicate column name {}",
                col.name
            )));
        }
    }

    let rowid_pk = pk_cols
        .first()
        .copied()
        .filter(|&i| columns[i].data_type == DataType::Integer);

    let tree = BTree::create(store)?;
    let def = TableDef {
        name: name.to_string(),
        columns,
        root: tree.root_page_id(),
        next_rowid: 1,
        rowid_pk,
    };
    catalog.create_table(store, &def)?;

    // Non-integer PRIMARY KEY: enforce uniqueness through an index.
    if let Some(&pk) = pk_cols.first() {
        if rowid_pk.is_none() {
            create_index(
                store,
                catalog,
                &format!("{}_pk", name),
                name,
                &def.columns[pk].name.clone(),
                true,
            )?;
        }
    }
    Ok(())
}

/// Drop a table, its indexes, and every page they own.
pub fn drop_table(
    store: &mut impl PageStore,
    catalog: &mut Catalog,
    name: &str,
) -> Result<()> {
    let table = Table::open(store, catalog, name)?;

    let tree = BTree::open(table.def.root);
    for pid in tree.collect_all_pages(store)? {
        store.free_page(pid);
    }
    for idx in &table.indexes {
        let index_tree = BTree::open(idx.root);
        for pid in index_tree.collect_all_pages(store)? {
            store.free_page(pid);
        }
        catalog.drop_index(store, &idx.name)?;
    }
    catalog.drop_table(store, name)?;
    Ok(())
}

/// Create a secondary index and backfill it from existing rows.
pub fn create_index(
    store: &mut impl PageStore,
    catalog: &mut Catalog,
    name: &str,
    table_name: &str,
    column_name: &str,
    unique: bool,
) -> Result<()> {
    let table = Table::open(store, catalog, table_name)?;
    let column = table.def.column_index(column_name).ok_or_else(|| {
        KuraError::Schema(format!(
            "no such column: {}.{}",
            table_name, column_name
        ))
    })?;

    let mut tree = BTree::create(store)?;
    let mut def = IndexDef {
        name: name.to_string(),
        table: table.def.name.clone(),
        column,
        unique,
        root: tree.root_page_id(),
    };
    catalog.create_index(store, &def)?;

    let mut cursor = table.scan();
    while let Some((rowid, values)) = cursor.next(store)? {
        let value = &values[column];
        if unique && !value.is_null() && index_has_value(&tree, store, value)? {
            cursor.close(store);
            return Err(KuraError::Schema(format!(
                "UNIQUE constraint failed: {}.{}",
                table_name, column_name
            )));
        }
        tree.insert(store, &encode_index_key(value, rowid)?, &rowid.to_le_bytes())?;
    }
    cursor.close(store);

    if tree.root_page_id() != def.root {
        def.root = tree.root_page_id();
        catalog.update_index(store, &def)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::{Pager, PagerOptions};
    use tempfile::TempDir;

    fn setup() -> (Pager, Catalog, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let wal = dir.path().join("test.wal");
        let mut pager =
            Pager::create_file(&db, &wal, None, 1, [0u8; 16], PagerOptions::default()).unwrap();
        let catalog = Catalog::create(&mut pager).unwrap();
        (pager, catalog, dir)
    }

    fn users_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef {
                name: "id".into(),
                data_type: DataType::Integer,
                primary_key: true,
                not_null: true,
            },
            ColumnDef {
                name: "name".into(),
                data_type: DataType::Text,
                primary_key: false,
                not_null: false,
            },
        ]
    }

    #[test]
    fn test_insert_and_lookup_pk() {
        let (mut pager, mut catalog, _dir) = setup();
        create_table(&mut pager, &mut catalog, "users", users_columns()).unwrap();

        let mut table = Table::open(&mut pager, &catalog, "users").unwrap();
        let rowid = table
            .insert_row(
                &mut pager,
                &mut catalog,
                vec![Value::Integer(1), Value::Text("Alice".into())],
            )
            .unwrap();
        assert_eq!(rowid, 1);

        let row = table.lookup_pk(&mut pager, 1).unwrap().unwrap();
        assert_eq!(row[1], Value::Text("Alice".into()));
        assert!(table.lookup_pk(&mut pager, 2).unwrap().is_none());
    }

    #[test]
    fn test_pk_auto_assignment_and_uniqueness() {
        let (mut pager, mut catalog, _dir) = setup();
        create_table(&mut pager, &mut catalog, "users", users_columns()).unwrap();
        let mut table = Table::open(&mut pager, &catalog, "users").unwrap();

        // NULL pk auto-assigns.
        let r1 = table
            .insert_row(&mut pager, &mut catalog, vec![Value::Null, Value::Null])
            .unwrap();
        assert_eq!(r1, 1);
        let r2 = table
            .insert_row(&mut pager, &mut catalog, vec![Value::Null, Value::Null])
            .unwrap();
        assert_eq!(r2, 2);

        // Explicit duplicate pk fails.
        let err = table
            .insert_row(&mut pager, &mut catalog, vec![Value::Integer(1), Value::Null])
            .unwrap_err();
        assert!(matches!(err, KuraError::Schema(_)));
    }

    #[test]
    fn test_update_delete_maintain_indexes() {
        let (mut pager, mut catalog, _dir) = setup();
        create_table(&mut pager, &mut catalog, "users", users_columns()).unwrap();
        {
            let mut table = Table::open(&mut pager, &catalog, "users").unwrap();
            for (id, name) in [(1, "Alice"), (2, "Bob"), (3, "Carol")] {
                table
                    .insert_row(
                        &mut pager,
                        &mut catalog,
                        vec![Value::Integer(id), Value::Text(name.into())],
                    )
                    .unwrap();
            }
        }
        create_index(&mut pager, &mut catalog, "idx_name", "users", "name", true).unwrap();

        let mut table = Table::open(&mut pager, &catalog, "users").unwrap();
        // Renaming Bob to Alice trips the unique index.
        let err = table
            .update_row(
                &mut pager,
                &mut catalog,
                2,
                vec![Value::Integer(2), Value::Text("Alice".into())],
            )
            .unwrap_err();
        assert!(matches!(err, KuraError::Schema(_)));

        table
            .update_row(
                &mut pager,
                &mut catalog,
                2,
                vec![Value::Integer(2), Value::Text("Bobby".into())],
            )
            .unwrap();
        assert!(table.delete_row(&mut pager, &mut catalog, 3).unwrap());

        // Re-inserting Carol must succeed now that the row is gone.
        let mut table = Table::open(&mut pager, &catalog, "users").unwrap();
        table
            .insert_row(
                &mut pager,
                &mut catalog,
                vec![Value::Integer(4), Value::Text("Carol".into())],
            )
            .unwrap();
    }

    #[test]
    fn test_scan_order() {
        let (mut pager, mut catalog, _dir) = setup();
        create_table(&mut pager, &mut catalog, "users", users_columns()).unwrap();
        let mut table = Table::open(&mut pager, &catalog, "users").unwrap();
        for id in [5, 1, 3] {
            table
                .insert_row(&mut pager, &mut catalog, vec![Value::Integer(id), Value::Null])
                .unwrap();
        }

        let mut cursor = table.scan();
        let mut ids = Vec::new();
        while let Some((rowid, _)) = cursor.next(&mut pager).unwrap() {
            ids.push(rowid);
        }
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn test_drop_table_frees_pages() {
        let (mut pager, mut catalog, _dir) = setup();
        create_table(&mut pager, &mut catalog, "users", users_columns()).unwrap();
        {
            let mut table = Table::open(&mut pager, &catalog, "users").unwrap();
            for i in 0..500 {
                table
                    .insert_row(
                        &mut pager,
                        &mut catalog,
                        vec![Value::Integer(i), Value::Text(format!("user-{}", i))],
                    )
                    .unwrap();
            }
        }
        let freelist_before = pager.freelist_len();
        drop_table(&mut pager, &mut catalog, "users").unwrap();
        assert!(pager.freelist_len() > freelist_before);
        assert!(catalog.get_table(&mut pager, "users").unwrap().is_none());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let (mut pager, mut catalog, _dir) = setup();
        create_table(&mut pager, &mut catalog, "users", users_columns()).unwrap();
        let mut table = Table::open(&mut pager, &catalog, "users").unwrap();
        let err = table
            .insert_row(
                &mut pager,
                &mut catalog,
                vec![Value::Text("oops".into()), Value::Null],
            )
            .unwrap_err();
        assert!(matches!(err, KuraError::Schema(_)));
    }
}
