//! Execution VM: interprets a compiled operator program against the
//! storage engine.
//!
//! The machine carries one open table, one cursor, and a register file
//! holding the decoded current row. Jumps are explicit indices into the
//! program. Mutating operators invalidate and re-root the cursor so
//! iteration stays correct across splits, merges and root changes made by
//! their own writes.

use std::collections::HashSet;

use crate::engine::{Table, TableCursor};
use crate::error::{KuraError, Result};
use crate::schema::catalog::Catalog;
use crate::sql::eval::{eval, is_true, RowContext};
use crate::sql::planner::{Op, Program};
use crate::storage::page_store::PageStore;
use crate::types::Value;

/// Materialized statement result.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub affected_rows: u64,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vec<Value>> {
        self.rows.iter()
    }
}

impl IntoIterator for QueryResult {
    type Item = Vec<Value>;
    type IntoIter = std::vec::IntoIter<Vec<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

pub fn execute_program(
    program: &Program,
    store: &mut impl PageStore,
    catalog: &mut Catalog,
    params: &[Value],
) -> Result<QueryResult> {
    let mut vm = Vm {
        store,
        catalog,
        params,
        table: None,
        table_columns: Vec::new(),
        cursor: None,
        current: None,
        rows: Vec::new(),
        affected: 0,
        count: 0,
        moved_rowids: HashSet::new(),
    };
    let outcome = vm.run(program);
    // Release cursor pins even when an operator failed mid-scan.
    if let Some(mut cursor) = vm.cursor.take() {
        cursor.close(vm.store);
    }
    outcome?;

    Ok(QueryResult {
        columns: program.columns.clone(),
        rows: vm.rows,
        affected_rows: vm.affected,
    })
}

struct Vm<'a, S: PageStore> {
    store: &'a mut S,
    catalog: &'a mut Catalog,
    params: &'a [Value],
    table: Option<Table>,
    table_columns: Vec<String>,
    cursor: Option<TableCursor>,
    /// Register file: rowid plus the decoded current row.
    current: Option<(i64, Vec<Value>)>,
    rows: Vec<Vec<Value>>,
    affected: u64,
    count: u64,
    /// Rows re-keyed by this statement's own UPDATE: their new rowids sit
    /// ahead of the cursor and must not be visited again.
    moved_rowids: HashSet<i64>,
}

impl<S: PageStore> Vm<'_, S> {
    fn run(&mut self, program: &Program) -> Result<()> {
        let mut pc = 0usize;
        let mut steps = 0u64;
        loop {
            let op = program.ops.get(pc).ok_or_else(|| {
                KuraError::Internal(format!("program counter {} out of range", pc))
            })?;
            // A program either halts or advances the cursor; this bound only
            // trips on a miscompiled jump loop.
            steps += 1;
            if steps > (1u64 << 40) {
                return Err(KuraError::Internal("runaway program".into()));
            }

            match op {
                Op::OpenRead { table } | Op::OpenWrite { table } => {
                    let t = Table::open(self.store, self.catalog, table)?;
                    self.table_columns = t.def.column_names();
                    self.table = Some(t);
                    pc += 1;
                }
                Op::Seek { key } => {
                    let cursor = {
                        let table = self.require_table()?;
                        match key {
                            None => Some(table.scan()),
                            Some(expr) => match eval(expr, None, self.params)? {
                                Value::Integer(v) => Some(table.seek_pk(v)),
                                // A NULL or non-integer key matches nothing.
                                _ => None,
                            },
                        }
                    };
                    self.cursor = cursor;
                    pc += 1;
                }
                Op::Next { jump_if_done } => {
                    let row = loop {
                        let next = match self.cursor.as_mut() {
                            Some(cursor) => cursor.next(self.store)?,
                            None => None,
                        };
                        match next {
                            Some((rowid, _)) if self.moved_rowids.contains(&rowid) => continue,
                            other => break other,
                        }
                    };
                    match row {
                        Some(entry) => {
                            self.current = Some(entry);
                            pc += 1;
                        }
                        None => {
                            self.current = None;
                            pc = *jump_if_done;
                        }
                    }
                }
                Op::Filter { pred, jump_if_not } => {
                    let value = {
                        let ctx = self.row_context()?;
                        eval(pred, Some(&ctx), self.params)?
                    };
                    if is_true(&value) {
                        pc += 1;
                    } else {
                        pc = *jump_if_not;
                    }
                }
                Op::Project { exprs } => {
                    let out = {
                        let ctx = self.row_context()?;
                        exprs
                            .iter()
                            .map(|e| eval(e, Some(&ctx), self.params))
                            .collect::<Result<Vec<Value>>>()?
                    };
                    self.rows.push(out);
                    pc += 1;
                }
                Op::InsertCell { columns, rows } => {
                    self.exec_insert(columns.as_deref(), rows)?;
                    pc += 1;
                }
                Op::UpdateCell { assignments } => {
                    self.exec_update(assignments)?;
                    pc += 1;
                }
                Op::DeleteCell => {
                    self.exec_delete()?;
                    pc += 1;
                }
                Op::CountStep => {
                    self.count += 1;
                    pc += 1;
                }
                Op::CountEmit => {
                    self.rows.push(vec![Value::Integer(self.count as i64)]);
                    pc += 1;
                }
                Op::Close => {
                    if let Some(mut cursor) = self.cursor.take() {
                        cursor.close(self.store);
                    }
                    self.table = None;
                    self.current = None;
                    pc += 1;
                }
                Op::Halt => return Ok(()),
                Op::Goto { target } => {
                    pc = *target;
                }
            }
        }
    }

    fn require_table(&self) -> Result<&Table> {
        self.table
            .as_ref()
            .ok_or_else(|| KuraError::Internal("operator before OpenRead/OpenWrite".into()))
    }

    fn row_context(&self) -> Result<RowContext<'_>> {
        let (_, values) = self
            .current
            .as_ref()
            .ok_or_else(|| KuraError::Internal("row operator with no current row".into()))?;
        Ok(RowContext {
            columns: &self.table_columns,
            values,
        })
    }

    fn exec_insert(
        &mut self,
        columns: Option<&[String]>,
        rows: &[Vec<crate::sql::ast::Expr>],
    ) -> Result<()> {
        let table = self
            .table
            .as_mut()
            .ok_or_else(|| KuraError::Internal("insert before OpenWrite".into()))?;

        for row_exprs in rows {
            let mut evaluated = Vec::with_capacity(row_exprs.len());
            for expr in row_exprs {
                evaluated.push(eval(expr, None, self.params)?);
            }

            let values = match columns {
                None => evaluated,
                Some(cols) => {
                    // Unlisted columns get NULL (auto-assignment handles an
                    // omitted INTEGER PRIMARY KEY).
                    let mut full = vec![Value::Null; table.def.columns.len()];
                    for (col, value) in cols.iter().zip(evaluated) {
                        let idx = table.def.column_index(col).ok_or_else(|| {
                            KuraError::Schema(format!("no such column: {}", col))
                        })?;
                        full[idx] = value;
                    }
                    full
                }
            };

            table.insert_row(self.store, self.catalog, values)?;
            self.affected += 1;
        }
        Ok(())
    }

    fn exec_update(&mut self, assignments: &[(usize, crate::sql::ast::Expr)]) -> Result<()> {
        let (rowid, new_values) = {
            let (rowid, old_values) = self
                .current
                .as_ref()
                .ok_or_else(|| KuraError::Internal("update with no current row".into()))?;
            let ctx = RowContext {
                columns: &self.table_columns,
                values: old_values,
            };
            let mut new_values = old_values.clone();
            for (idx, expr) in assignments {
                new_values[*idx] = eval(expr, Some(&ctx), self.params)?;
            }
            (*rowid, new_values)
        };

        let table = self
            .table
            .as_mut()
            .ok_or_else(|| KuraError::Internal("update before OpenWrite".into()))?;
        if let Some(pk_idx) = table.def.rowid_pk {
            if let Value::Integer(new_rowid) = new_values[pk_idx] {
                if new_rowid != rowid {
                    self.moved_rowids.insert(new_rowid);
                }
            }
        }
        table.update_row(self.store, self.catalog, rowid, new_values)?;
        self.affected += 1;

        // The write may have split or merged pages under the cursor.
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.invalidate(self.store);
            cursor.reroot(table.def.root);
        }
        Ok(())
    }

    fn exec_delete(&mut self) -> Result<()> {
        let rowid = self
            .current
            .as_ref()
            .map(|(rowid, _)| *rowid)
            .ok_or_else(|| KuraError::Internal("delete with no current row".into()))?;

        let table = self
            .table
            .as_mut()
            .ok_or_else(|| KuraError::Internal("delete before OpenWrite".into()))?;
        table.delete_row(self.store, self.catalog, rowid)?;
        self.affected += 1;

        if let Some(cursor) = self.cursor.as_mut() {
            cursor.invalidate(self.store);
            cursor.reroot(table.def.root);
        }
        Ok(())
    }
}
