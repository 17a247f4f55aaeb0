//! Connection: a per-session handle over the shared database.
//!
//! Each connection carries its own catalog view, transaction state and
//! prepared statements. Write statements (and explicit transactions)
//! funnel through the database's single writer token; reads outside a
//! transaction run against committed state with no WAL traffic.
//!
//! A statement error inside a transaction aborts the whole transaction —
//! dirty pages are discarded before the error surfaces. Corruption and
//! crypto failures poison the connection: every later call is refused
//! until the database is reopened.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::engine::{self, EngineStats, Table};
use crate::error::{KuraError, Result};
use crate::schema::catalog::Catalog;
use crate::sql::ast::Statement;
use crate::sql::parser::parse_sql;
use crate::sql::planner::{compile, Plan};
use crate::sql::vm::{execute_program, QueryResult};
use crate::storage::page_store::{PageStore, ReadPageStore};
use crate::tx::page_store::TxPageStore;
use crate::tx::transaction::Transaction;
use crate::types::Value;
use crate::Shared;

pub type StmtId = u64;

/// Prepared-statement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtState {
    Fresh,
    Bound,
    Executed,
}

struct Prepared {
    plan: Plan,
    params: Vec<Option<Value>>,
    state: StmtState,
}

pub struct Connection {
    shared: Arc<Shared>,
    catalog: Catalog,
    tx: Option<Transaction>,
    holds_writer: bool,
    stmts: HashMap<StmtId, Prepared>,
    next_stmt_id: StmtId,
    poisoned: Option<String>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let catalog = Catalog::open(shared.pager.lock().catalog_root());
        Connection {
            shared,
            catalog,
            tx: None,
            holds_writer: false,
            stmts: HashMap::new(),
            next_stmt_id: 1,
            poisoned: None,
        }
    }

    fn guard(&self) -> Result<()> {
        if let Some(msg) = &self.poisoned {
            return Err(KuraError::Misuse(format!(
                "connection is poisoned: {}",
                msg
            )));
        }
        Ok(())
    }

    fn note_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.poisoned = Some(e.to_string());
            }
        }
        result
    }

    /// Execute one SQL statement.
    pub fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.guard()?;
        let stmt = parse_sql(sql)?;
        let result = match stmt {
            Statement::Begin => self.begin().map(|_| QueryResult::default()),
            Statement::Commit => self.commit().map(|_| QueryResult::default()),
            Statement::Rollback => self.rollback().map(|_| QueryResult::default()),
            other => self.run_statement(&other, &[]),
        };
        self.note_fatal(result)
    }

    /// Execute a read-only statement; writes are refused.
    pub fn query(&mut self, sql: &str) -> Result<QueryResult> {
        self.guard()?;
        let stmt = parse_sql(sql)?;
        if !stmt.is_read_only() {
            return Err(KuraError::Misuse(
                "query() accepts read-only SQL; use execute() for writes".into(),
            ));
        }
        let result = self.run_statement(&stmt, &[]);
        self.note_fatal(result)
    }

    // --- Transactions ---

    pub fn begin(&mut self) -> Result<()> {
        self.guard()?;
        if self.tx.is_some() {
            return Err(KuraError::Misuse("transaction already active".into()));
        }
        self.acquire_writer()?;
        self.refresh_catalog();
        let txid = self.shared.next_txid.fetch_add(1, Ordering::SeqCst);
        let lsn = self.shared.pager.lock().current_lsn();
        self.tx = Some(Transaction::begin(txid, lsn));
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.guard()?;
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| KuraError::Misuse("no active transaction".into()))?;

        let flushed = {
            let mut pager = self.shared.pager.lock();
            pager.set_catalog_root(self.catalog.root_page_id());
            pager.flush_tx(&mut tx)
        };
        match flushed {
            Ok(_) => {
                self.release_writer();
                Ok(())
            }
            Err(e) => {
                let _ = self.shared.pager.lock().discard_tx(&mut tx);
                self.release_writer();
                self.refresh_catalog();
                self.note_fatal(Err(e))
            }
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.guard()?;
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| KuraError::Misuse("no active transaction".into()))?;
        let result = self.shared.pager.lock().discard_tx(&mut tx);
        self.release_writer();
        self.refresh_catalog();
        self.note_fatal(result)
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    // --- Statement execution ---

    fn run_statement(&mut self, stmt: &Statement, params: &[Value]) -> Result<QueryResult> {
        if self.tx.is_some() {
            return self.run_in_tx(|store, catalog, params| {
                let plan = compile(stmt, store, catalog)?;
                run_plan(&plan, store, catalog, params)
            }, params);
        }

        self.refresh_catalog();
        let plan = {
            let mut store = ReadPageStore::new(&self.shared.pager);
            compile(stmt, &mut store, &self.catalog)?
        };
        self.dispatch_plan(&plan, params)
    }

    /// Run pre-compiled or just-compiled work inside the active transaction.
    /// Any error aborts the transaction before it surfaces.
    fn run_in_tx<F>(&mut self, body: F, params: &[Value]) -> Result<QueryResult>
    where
        F: FnOnce(&mut TxPageStore<'_>, &mut Catalog, &[Value]) -> Result<QueryResult>,
    {
        let mut tx = self.tx.take().expect("active transaction");
        let result = {
            let mut store = TxPageStore::new(&self.shared.pager, &mut tx);
            body(&mut store, &mut self.catalog, params)
        };
        match result {
            Ok(r) => {
                self.tx = Some(tx);
                Ok(r)
            }
            Err(e) => {
                let _ = self.shared.pager.lock().discard_tx(&mut tx);
                self.release_writer();
                self.refresh_catalog();
                Err(e)
            }
        }
    }

    fn dispatch_plan(&mut self, plan: &Plan, params: &[Value]) -> Result<QueryResult> {
        if self.tx.is_some() {
            return self.run_in_tx(
                |store, catalog, params| run_plan(plan, store, catalog, params),
                params,
            );
        }
        if plan.is_read_only() {
            let mut store = ReadPageStore::new(&self.shared.pager);
            return run_plan(plan, &mut store, &mut self.catalog, params);
        }
        self.auto_commit(plan, params)
    }

    /// Implicit single-statement transaction around a write plan.
    fn auto_commit(&mut self, plan: &Plan, params: &[Value]) -> Result<QueryResult> {
        self.acquire_writer()?;
        let txid = self.shared.next_txid.fetch_add(1, Ordering::SeqCst);
        let lsn = self.shared.pager.lock().current_lsn();
        let mut tx = Transaction::begin(txid, lsn);

        let result = {
            let mut store = TxPageStore::new(&self.shared.pager, &mut tx);
            run_plan(plan, &mut store, &mut self.catalog, params)
        };

        match result {
            Ok(r) => {
                let flushed = {
                    let mut pager = self.shared.pager.lock();
                    pager.set_catalog_root(self.catalog.root_page_id());
                    pager.flush_tx(&mut tx)
                };
                match flushed {
                    Ok(_) => {
                        self.release_writer();
                        Ok(r)
                    }
                    Err(e) => {
                        let _ = self.shared.pager.lock().discard_tx(&mut tx);
                        self.release_writer();
                        self.refresh_catalog();
                        Err(e)
                    }
                }
            }
            Err(e) => {
                let _ = self.shared.pager.lock().discard_tx(&mut tx);
                self.release_writer();
                self.refresh_catalog();
                Err(e)
            }
        }
    }

    fn refresh_catalog(&mut self) {
        if self.tx.is_none() {
            self.catalog = Catalog::open(self.shared.pager.lock().catalog_root());
        }
    }

    fn acquire_writer(&mut self) -> Result<()> {
        if self.holds_writer {
            return Ok(());
        }
        let retries = self.shared.options.busy_retries;
        let mut delay = self.shared.options.busy_base_delay_ms;
        for attempt in 0..=retries {
            if self.shared.writer_rx.try_recv().is_ok() {
                self.holds_writer = true;
                return Ok(());
            }
            if attempt < retries {
                std::thread::sleep(std::time::Duration::from_millis(delay));
                delay = delay.saturating_mul(2);
            }
        }
        Err(KuraError::Busy(
            "another connection holds the write transaction".into(),
        ))
    }

    fn release_writer(&mut self) {
        if self.holds_writer {
            let _ = self.shared.writer_tx.send(());
            self.holds_writer = false;
        }
    }

    // --- Prepared statements ---

    /// Compile a statement for later execution with bound parameters.
    pub fn prepare(&mut self, sql: &str) -> Result<StmtId> {
        self.guard()?;
        let stmt = parse_sql(sql)?;
        if matches!(
            stmt,
            Statement::Begin | Statement::Commit | Statement::Rollback
        ) {
            return Err(KuraError::Misuse(
                "transaction control cannot be prepared".into(),
            ));
        }

        let plan = if self.tx.is_some() {
            let mut tx = self.tx.take().expect("active transaction");
            let compiled = {
                let mut store = TxPageStore::new(&self.shared.pager, &mut tx);
                compile(&stmt, &mut store, &self.catalog)
            };
            self.tx = Some(tx);
            compiled?
        } else {
            self.refresh_catalog();
            let mut store = ReadPageStore::new(&self.shared.pager);
            compile(&stmt, &mut store, &self.catalog)?
        };

        let n_params = plan.param_count();
        let id = self.next_stmt_id;
        self.next_stmt_id += 1;
        self.stmts.insert(
            id,
            Prepared {
                plan,
                params: vec![None; n_params],
                state: StmtState::Fresh,
            },
        );
        Ok(id)
    }

    /// Bind a value to a 0-based parameter slot.
    pub fn bind(&mut self, stmt: StmtId, index: usize, value: Value) -> Result<()> {
        self.guard()?;
        let prepared = self
            .stmts
            .get_mut(&stmt)
            .ok_or_else(|| KuraError::Misuse(format!("unknown statement handle {}", stmt)))?;
        if index >= prepared.params.len() {
            return Err(KuraError::Misuse(format!(
                "parameter index {} out of range (statement has {})",
                index,
                prepared.params.len()
            )));
        }
        prepared.params[index] = Some(value);
        prepared.state = StmtState::Bound;
        Ok(())
    }

    /// Execute a prepared statement; unbound slots resolve to NULL.
    pub fn execute_stmt(&mut self, stmt: StmtId) -> Result<QueryResult> {
        self.guard()?;
        let (plan, params) = {
            let prepared = self
                .stmts
                .get(&stmt)
                .ok_or_else(|| KuraError::Misuse(format!("unknown statement handle {}", stmt)))?;
            let params: Vec<Value> = prepared
                .params
                .iter()
                .map(|p| p.clone().unwrap_or(Value::Null))
                .collect();
            (prepared.plan.clone(), params)
        };

        let result = self.dispatch_plan(&plan, &params);
        if let Some(prepared) = self.stmts.get_mut(&stmt) {
            prepared.state = StmtState::Executed;
        }
        self.note_fatal(result)
    }

    /// Clear bindings; the statement can be re-bound and re-executed.
    pub fn reset_stmt(&mut self, stmt: StmtId) -> Result<()> {
        self.guard()?;
        let prepared = self
            .stmts
            .get_mut(&stmt)
            .ok_or_else(|| KuraError::Misuse(format!("unknown statement handle {}", stmt)))?;
        for slot in &mut prepared.params {
            *slot = None;
        }
        prepared.state = StmtState::Fresh;
        Ok(())
    }

    pub fn finalize_stmt(&mut self, stmt: StmtId) -> Result<()> {
        self.stmts
            .remove(&stmt)
            .map(|_| ())
            .ok_or_else(|| KuraError::Misuse(format!("unknown statement handle {}", stmt)))
    }

    pub fn stmt_state(&self, stmt: StmtId) -> Option<StmtState> {
        self.stmts.get(&stmt).map(|p| p.state)
    }

    // --- Introspection ---

    pub fn list_tables(&mut self) -> Result<Vec<String>> {
        self.guard()?;
        self.refresh_catalog();
        let mut store = ReadPageStore::new(&self.shared.pager);
        let mut names: Vec<String> = self
            .catalog
            .list_tables(&mut store)?
            .into_iter()
            .map(|t| t.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Rendered CREATE statements, optionally for one table only.
    pub fn schema_sql(&mut self, table: Option<&str>) -> Result<Vec<String>> {
        self.guard()?;
        self.refresh_catalog();
        let mut store = ReadPageStore::new(&self.shared.pager);
        let mut out = Vec::new();
        for def in self.catalog.list_tables(&mut store)? {
            if let Some(filter) = table {
                if !def.name.eq_ignore_ascii_case(filter) {
                    continue;
                }
            }
            out.push(def.to_sql());
            for idx in self.catalog.indexes_for_table(&mut store, &def.name)? {
                // The implicit non-integer PK index is part of CREATE TABLE.
                if idx.name == format!("{}_pk", def.name) {
                    continue;
                }
                out.push(idx.to_sql(&def.columns[idx.column].name));
            }
        }
        if out.is_empty() {
            if let Some(filter) = table {
                return Err(KuraError::Schema(format!("no such table: {}", filter)));
            }
        }
        Ok(out)
    }

    pub fn stats(&mut self) -> Result<EngineStats> {
        self.guard()?;
        self.refresh_catalog();
        let (table_count, index_count) = {
            let mut store = ReadPageStore::new(&self.shared.pager);
            (
                self.catalog.list_tables(&mut store)?.len(),
                self.catalog.list_indexes(&mut store)?.len(),
            )
        };
        let pager = self.shared.pager.lock();
        let hits = pager.cache_hits();
        let misses = pager.cache_misses();
        let total = hits + misses;
        Ok(EngineStats {
            table_count,
            index_count,
            page_count: pager.page_count(),
            cached_pages: pager.cached_pages(),
            cache_hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        })
    }

    /// Materialize committed WAL content into the main file.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.guard()?;
        if self.tx.is_some() {
            return Err(KuraError::Misuse(
                "checkpoint inside a transaction".into(),
            ));
        }
        let result = self.shared.pager.lock().checkpoint();
        self.note_fatal(result)
    }

    /// Open a cursor-backed point lookup (library convenience).
    pub fn lookup_pk(&mut self, table: &str, rowid: i64) -> Result<Option<Vec<Value>>> {
        self.guard()?;
        self.refresh_catalog();
        let mut store = ReadPageStore::new(&self.shared.pager);
        let t = Table::open(&mut store, &self.catalog, table)?;
        t.lookup_pk(&mut store, rowid)
    }

    /// Roll back any active transaction and drop prepared statements.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if let Some(mut tx) = self.tx.take() {
            let _ = self.shared.pager.lock().discard_tx(&mut tx);
        }
        self.release_writer();
        self.stmts.clear();
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

/// Execute a compiled plan against the given page store.
fn run_plan(
    plan: &Plan,
    store: &mut impl PageStore,
    catalog: &mut Catalog,
    params: &[Value],
) -> Result<QueryResult> {
    match plan {
        Plan::CreateTable {
            table_name,
            columns,
            if_not_exists,
        } => {
            if *if_not_exists && catalog.get_table(store, table_name)?.is_some() {
                return Ok(QueryResult::default());
            }
            engine::create_table(store, catalog, table_name, columns.clone())?;
            Ok(QueryResult::default())
        }
        Plan::DropTable {
            table_name,
            if_exists,
        } => {
            if *if_exists && catalog.get_table(store, table_name)?.is_none() {
                return Ok(QueryResult::default());
            }
            engine::drop_table(store, catalog, table_name)?;
            Ok(QueryResult::default())
        }
        Plan::CreateIndex {
            index_name,
            table_name,
            column_name,
            unique,
            if_not_exists,
        } => {
            if *if_not_exists && catalog.get_index(store, index_name)?.is_some() {
                return Ok(QueryResult::default());
            }
            engine::create_index(store, catalog, index_name, table_name, column_name, *unique)?;
            Ok(QueryResult::default())
        }
        Plan::Program(program) => execute_program(program, store, catalog, params),
    }
}
