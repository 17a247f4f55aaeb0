//! Planner: AST to executable plans.
//!
//! DDL statements become direct engine plans. DML and queries compile to a
//! `Program` — a linear operator sequence with explicit jump targets,
//! interpreted by the VM. The only access-path decision made here is the
//! primary-key point lookup: a WHERE clause of the shape `pk = <expr>` on a
//! rowid table seeks instead of scanning.

use crate::error::{KuraError, Result};
use crate::schema::catalog::Catalog;
use crate::schema::column::{ColumnDef, TableDef};
use crate::sql::ast::{
    BinaryOp, ColumnSpec, Expr, Select, SelectColumn, Statement,
};
use crate::storage::page_store::PageStore;

#[derive(Debug, Clone)]
pub enum Plan {
    CreateTable {
        table_name: String,
        columns: Vec<ColumnDef>,
        if_not_exists: bool,
    },
    DropTable {
        table_name: String,
        if_exists: bool,
    },
    CreateIndex {
        index_name: String,
        table_name: String,
        column_name: String,
        unique: bool,
        if_not_exists: bool,
    },
    Program(Program),
}

impl Plan {
    pub fn is_read_only(&self) -> bool {
        match self {
            Plan::Program(p) => !p.writes,
            _ => false,
        }
    }

    pub fn param_count(&self) -> usize {
        match self {
            Plan::Program(p) => p.n_params,
            _ => 0,
        }
    }
}

/// One operator of a compiled program. Jump targets index into the
/// program's op vector.
#[derive(Debug, Clone)]
pub enum Op {
    OpenRead { table: String },
    OpenWrite { table: String },
    /// Position the cursor: None = before the first row; Some = at the
    /// given primary-key value only (point lookup).
    Seek { key: Option<Expr> },
    /// Load the next row, or jump when the cursor is exhausted.
    Next { jump_if_done: usize },
    /// Reject the current row unless the predicate is definitely true.
    Filter { pred: Expr, jump_if_not: usize },
    /// Emit a result row from the current registers.
    Project { exprs: Vec<Expr> },
    /// Evaluate and insert rows (the whole statement in one operator).
    InsertCell {
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    /// Rewrite the current row with the given column assignments.
    UpdateCell { assignments: Vec<(usize, Expr)> },
    /// Delete the current row.
    DeleteCell,
    CountStep,
    CountEmit,
    Close,
    Halt,
    Goto { target: usize },
}

#[derive(Debug, Clone)]
pub struct Program {
    pub ops: Vec<Op>,
    pub table: String,
    /// Result column labels.
    pub columns: Vec<String>,
    pub n_params: usize,
    pub writes: bool,
}

/// Compile a statement against the current schema. BEGIN/COMMIT/ROLLBACK
/// are session-level and never reach the planner.
pub fn compile(
    stmt: &Statement,
    store: &mut impl PageStore,
    catalog: &Catalog,
) -> Result<Plan> {
    match stmt {
        Statement::CreateTable(ct) => {
            let columns = ct
                .columns
                .iter()
                .map(|c: &ColumnSpec| ColumnDef {
                    name: c.name.clone(),
                    data_type: c.data_type,
                    primary_key: c.primary_key,
                    not_null: c.not_null || c.primary_key,
                })
                .collect();
            Ok(Plan::CreateTable {
                table_name: ct.table_name.clone(),
                columns,
                if_not_exists: ct.if_not_exists,
            })
        }
        Statement::DropTable(dt) => Ok(Plan::DropTable {
            table_name: dt.table_name.clone(),
            if_exists: dt.if_exists,
        }),
        Statement::CreateIndex(ci) => Ok(Plan::CreateIndex {
            index_name: ci.index_name.clone(),
            table_name: ci.table_name.clone(),
            column_name: ci.column_name.clone(),
            unique: ci.unique,
            if_not_exists: ci.if_not_exists,
        }),
        Statement::Insert(ins) => compile_insert(ins, store, catalog),
        Statement::Select(sel) => compile_select(sel, store, catalog),
        Statement::Update(upd) => compile_update(upd, store, catalog),
        Statement::Delete(del) => compile_delete(del, store, catalog),
        Statement::Begin | Statement::Commit | Statement::Rollback => Err(KuraError::Internal(
            "transaction control reached the planner".into(),
        )),
    }
}

fn resolve_table(
    store: &mut impl PageStore,
    catalog: &Catalog,
    name: &str,
) -> Result<TableDef> {
    catalog
        .get_table(store, name)?
        .ok_or_else(|| KuraError::Schema(format!("no such table: {}", name)))
}

fn check_columns_exist(def: &TableDef, expr: &Expr) -> Result<()> {
    match expr {
        Expr::Column(name) => {
            if def.column_index(name).is_none() {
                return Err(KuraError::Schema(format!(
                    "no such column: {}.{}",
                    def.name, name
                )));
            }
            Ok(())
        }
        Expr::Binary { left, right, .. } => {
            check_columns_exist(def, left)?;
            check_columns_exist(def, right)
        }
        Expr::Unary { operand, .. } | Expr::IsNull { operand, .. } => {
            check_columns_exist(def, operand)
        }
        _ => Ok(()),
    }
}

fn max_params(exprs: &[&Expr]) -> usize {
    exprs.iter().map(|e| e.param_count()).max().unwrap_or(0)
}

/// `pk = <literal/param expr>` on a rowid table turns a scan into a seek.
/// The key expression must not reference columns.
fn pk_seek_key(def: &TableDef, where_clause: &Option<Expr>) -> Option<Expr> {
    let pk_idx = def.rowid_pk?;
    let pk_name = &def.columns[pk_idx].name;
    let Some(Expr::Binary { left, op: BinaryOp::Eq, right }) = where_clause else {
        return None;
    };
    let key = match (left.as_ref(), right.as_ref()) {
        (Expr::Column(c), key) if c.eq_ignore_ascii_case(pk_name) => key,
        (key, Expr::Column(c)) if c.eq_ignore_ascii_case(pk_name) => key,
        _ => return None,
    };
    match key {
        Expr::Literal(_) | Expr::Param(_) => Some(key.clone()),
        _ => None,
    }
}

fn compile_insert(
    ins: &crate::sql::ast::Insert,
    store: &mut impl PageStore,
    catalog: &Catalog,
) -> Result<Plan> {
    let def = resolve_table(store, catalog, &ins.table_name)?;

    if let Some(cols) = &ins.columns {
        for col in cols {
            if def.column_index(col).is_none() {
                return Err(KuraError::Schema(format!(
                    "no such column: {}.{}",
                    def.name, col
                )));
            }
        }
        for row in &ins.rows {
            if row.len() != cols.len() {
                return Err(KuraError::Schema(
                    "value count does not match column list".into(),
                ));
            }
        }
    } else {
        for row in &ins.rows {
            if row.len() != def.columns.len() {
                return Err(KuraError::Schema(format!(
                    "table {} has {} columns but {} values were supplied",
                    def.name,
                    def.columns.len(),
                    row.len()
                )));
            }
        }
    }

    let n_params = ins
        .rows
        .iter()
        .flat_map(|row| row.iter())
        .map(|e| e.param_count())
        .max()
        .unwrap_or(0);

    let ops = vec![
        Op::OpenWrite {
            table: def.name.clone(),
        },
        Op::InsertCell {
            columns: ins.columns.clone(),
            rows: ins.rows.clone(),
        },
        Op::Close,
        Op::Halt,
    ];
    Ok(Plan::Program(Program {
        ops,
        table: def.name,
        columns: Vec::new(),
        n_params,
        writes: true,
    }))
}

fn compile_select(
    sel: &Select,
    store: &mut impl PageStore,
    catalog: &Catalog,
) -> Result<Plan> {
    let def = resolve_table(store, catalog, &sel.table_name)?;

    if let Some(pred) = &sel.where_clause {
        check_columns_exist(&def, pred)?;
    }

    let count_star = matches!(sel.columns.as_slice(), [SelectColumn::CountStar]);
    let mut labels = Vec::new();
    let mut exprs = Vec::new();
    if count_star {
        labels.push("count(*)".to_string());
    } else {
        for col in &sel.columns {
            match col {
                SelectColumn::Star => {
                    for c in &def.columns {
                        labels.push(c.name.clone());
                        exprs.push(Expr::Column(c.name.clone()));
                    }
                }
                SelectColumn::CountStar => {
                    return Err(KuraError::Schema(
                        "count(*) cannot be mixed with other columns".into(),
                    ))
                }
                SelectColumn::Expr(e, alias) => {
                    check_columns_exist(&def, e)?;
                    labels.push(alias.clone().unwrap_or_else(|| render_label(e)));
                    exprs.push(e.clone());
                }
            }
        }
    }

    let mut n_params = sel
        .where_clause
        .as_ref()
        .map(|e| e.param_count())
        .unwrap_or(0);
    n_params = n_params.max(max_params(&exprs.iter().collect::<Vec<_>>()));

    // Layout:
    //   0 OpenRead  1 Seek  2 Next{done}  3 [Filter{2}]  4 body  5 Goto{2}
    let seek_key = pk_seek_key(&def, &sel.where_clause);
    let mut ops = vec![
        Op::OpenRead {
            table: def.name.clone(),
        },
        Op::Seek { key: seek_key },
    ];
    let next_pc = ops.len();
    ops.push(Op::Next { jump_if_done: 0 }); // patched below
    if let Some(pred) = &sel.where_clause {
        ops.push(Op::Filter {
            pred: pred.clone(),
            jump_if_not: next_pc,
        });
    }
    if count_star {
        ops.push(Op::CountStep);
    } else {
        ops.push(Op::Project { exprs });
    }
    ops.push(Op::Goto { target: next_pc });
    let done = ops.len();
    if let Op::Next { jump_if_done } = &mut ops[next_pc] {
        *jump_if_done = done;
    }
    if count_star {
        ops.push(Op::CountEmit);
    }
    ops.push(Op::Close);
    ops.push(Op::Halt);

    Ok(Plan::Program(Program {
        ops,
        table: def.name,
        columns: labels,
        n_params,
        writes: false,
    }))
}

fn render_label(expr: &Expr) -> String {
    match expr {
        Expr::Column(name) => name.clone(),
        Expr::Literal(v) => v.to_string(),
        Expr::Param(n) => format!("?{}", n),
        _ => "expr".to_string(),
    }
}

fn compile_update(
    upd: &crate::sql::ast::Update,
    store: &mut impl PageStore,
    catalog: &Catalog,
) -> Result<Plan> {
    let def = resolve_table(store, catalog, &upd.table_name)?;

    let mut assignments = Vec::with_capacity(upd.assignments.len());
    for (name, expr) in &upd.assignments {
        let idx = def.column_index(name).ok_or_else(|| {
            KuraError::Schema(format!("no such column: {}.{}", def.name, name))
        })?;
        check_columns_exist(&def, expr)?;
        assignments.push((idx, expr.clone()));
    }
    if let Some(pred) = &upd.where_clause {
        check_columns_exist(&def, pred)?;
    }

    let mut n_params = upd
        .where_clause
        .as_ref()
        .map(|e| e.param_count())
        .unwrap_or(0);
    for (_, e) in &assignments {
        n_params = n_params.max(e.param_count());
    }

    let seek_key = pk_seek_key(&def, &upd.where_clause);
    let mut ops = vec![
        Op::OpenWrite {
            table: def.name.clone(),
        },
        Op::Seek { key: seek_key },
    ];
    let next_pc = ops.len();
    ops.push(Op::Next { jump_if_done: 0 });
    if let Some(pred) = &upd.where_clause {
        ops.push(Op::Filter {
            pred: pred.clone(),
            jump_if_not: next_pc,
        });
    }
    ops.push(Op::UpdateCell { assignments });
    ops.push(Op::Goto { target: next_pc });
    let done = ops.len();
    if let Op::Next { jump_if_done } = &mut ops[next_pc] {
        *jump_if_done = done;
    }
    ops.push(Op::Close);
    ops.push(Op::Halt);

    Ok(Plan::Program(Program {
        ops,
        table: def.name,
        columns: Vec::new(),
        n_params,
        writes: true,
    }))
}

fn compile_delete(
    del: &crate::sql::ast::Delete,
    store: &mut impl PageStore,
    catalog: &Catalog,
) -> Result<Plan> {
    let def = resolve_table(store, catalog, &del.table_name)?;
    if let Some(pred) = &del.where_clause {
        check_columns_exist(&def, pred)?;
    }
    let n_params = del
        .where_clause
        .as_ref()
        .map(|e| e.param_count())
        .unwrap_or(0);

    let seek_key = pk_seek_key(&def, &del.where_clause);
    let mut ops = vec![
        Op::OpenWrite {
            table: def.name.clone(),
        },
        Op::Seek { key: seek_key },
    ];
    let next_pc = ops.len();
    ops.push(Op::Next { jump_if_done: 0 });
    if let Some(pred) = &del.where_clause {
        ops.push(Op::Filter {
            pred: pred.clone(),
            jump_if_not: next_pc,
        });
    }
    ops.push(Op::DeleteCell);
    ops.push(Op::Goto { target: next_pc });
    let done = ops.len();
    if let Op::Next { jump_if_done } = &mut ops[next_pc] {
        *jump_if_done = done;
    }
    ops.push(Op::Close);
    ops.push(Op::Halt);

    Ok(Plan::Program(Program {
        ops,
        table: def.name,
        columns: Vec::new(),
        n_params,
        writes: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::create_table;
    use crate::sql::parser::parse_sql;
    use crate::storage::pager::{Pager, PagerOptions};
    use crate::types::DataType;
    use tempfile::TempDir;

    fn setup() -> (Pager, Catalog, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("t.db");
        let wal = dir.path().join("t.wal");
        let mut pager =
            Pager::create_file(&db, &wal, None, 1, [0u8; 16], PagerOptions::default()).unwrap();
        let mut catalog = Catalog::create(&mut pager).unwrap();
        create_table(
            &mut pager,
            &mut catalog,
            "users",
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
            ],
        )
        .unwrap();
        (pager, catalog, dir)
    }

    fn plan(sql: &str, pager: &mut Pager, catalog: &Catalog) -> Result<Plan> {
        compile(&parse_sql(sql).unwrap(), pager, catalog)
    }

    #[test]
    fn test_select_star_columns() {
        let (mut pager, catalog, _d) = setup();
        let Plan::Program(p) = plan("SELECT * FROM users", &mut pager, &catalog).unwrap() else {
            panic!()
        };
        assert_eq!(p.columns, vec!["id", "name"]);
        assert!(!p.writes);
    }

    #[test]
    fn test_unknown_table_and_column() {
        let (mut pager, catalog, _d) = setup();
        assert!(matches!(
            plan("SELECT * FROM missing", &mut pager, &catalog),
            Err(KuraError::Schema(_))
        ));
        assert!(matches!(
            plan("SELECT nope FROM users", &mut pager, &catalog),
            Err(KuraError::Schema(_))
        ));
    }

    #[test]
    fn test_pk_point_lookup_uses_seek() {
        let (mut pager, catalog, _d) = setup();
        let Plan::Program(p) =
            plan("SELECT * FROM users WHERE id = 5", &mut pager, &catalog).unwrap()
        else {
            panic!()
        };
        assert!(matches!(p.ops[1], Op::Seek { key: Some(_) }));

        // Non-PK predicates scan.
        let Plan::Program(p) =
            plan("SELECT * FROM users WHERE name = 'x'", &mut pager, &catalog).unwrap()
        else {
            panic!()
        };
        assert!(matches!(p.ops[1], Op::Seek { key: None }));
    }

    #[test]
    fn test_jump_targets_consistent() {
        let (mut pager, catalog, _d) = setup();
        for sql in [
            "SELECT * FROM users WHERE id > 1",
            "SELECT count(*) FROM users",
            "UPDATE users SET name = 'x' WHERE id = 1",
            "DELETE FROM users WHERE name IS NULL",
        ] {
            let Plan::Program(p) = plan(sql, &mut pager, &catalog).unwrap() else {
                panic!()
            };
            for op in &p.ops {
                let target = match op {
                    Op::Next { jump_if_done } => Some(*jump_if_done),
                    Op::Filter { jump_if_not, .. } => Some(*jump_if_not),
                    Op::Goto { target } => Some(*target),
                    _ => None,
                };
                if let Some(t) = target {
                    assert!(t < p.ops.len(), "jump out of range in {}", sql);
                }
            }
            assert!(matches!(p.ops.last(), Some(Op::Halt)));
        }
    }

    #[test]
    fn test_insert_param_count() {
        let (mut pager, catalog, _d) = setup();
        let p = plan("INSERT INTO users VALUES (?, ?)", &mut pager, &catalog).unwrap();
        assert_eq!(p.param_count(), 2);
        assert!(!p.is_read_only());
    }

    #[test]
    fn test_insert_arity_checked() {
        let (mut pager, catalog, _d) = setup();
        assert!(matches!(
            plan("INSERT INTO users VALUES (1)", &mut pager, &catalog),
            Err(KuraError::Schema(_))
        ));
        assert!(matches!(
            plan(
                "INSERT INTO users (id, nope) VALUES (1, 2)",
                &mut pager,
                &catalog
            ),
            Err(KuraError::Schema(_))
        ));
    }
}
