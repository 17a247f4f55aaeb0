//! Recursive-descent SQL parser.
//!
//! Statement grammar (practical subset):
//!   CREATE TABLE [IF NOT EXISTS] t (col type [PRIMARY KEY] [NOT NULL], ...)
//!   DROP TABLE [IF EXISTS] t
//!   CREATE [UNIQUE] INDEX [IF NOT EXISTS] name ON t (col)
//!   INSERT INTO t [(cols)] VALUES (exprs), ...
//!   SELECT * | count(*) | exprs FROM t [WHERE expr]
//!   UPDATE t SET col = expr, ... [WHERE expr]
//!   DELETE FROM t [WHERE expr]
//!   BEGIN | COMMIT | ROLLBACK
//!
//! Positional parameters: bare `?` takes the next slot in textual order;
//! `?N` names slot N directly (0-based).

use crate::error::{KuraError, Result};
use crate::sql::ast::*;
use crate::sql::lexer::{tokenize, Tok, Token};
use crate::types::{DataType, Value};

/// Keywords that never act as column references in an expression.
const RESERVED: &[&str] = &[
    "SELECT", "FROM", "WHERE", "INSERT", "INTO", "VALUES", "UPDATE", "SET", "DELETE", "CREATE",
    "DROP", "TABLE", "INDEX", "AND", "OR", "NOT", "IS", "AS", "ON", "BEGIN", "COMMIT", "ROLLBACK",
];

pub fn parse_sql(sql: &str) -> Result<Statement> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end_offset: sql.len(),
        next_param: 0,
    };
    let stmt = parser.parse_statement()?;
    parser.skip(&Tok::Semi);
    if !parser.at_end() {
        return Err(parser.error_here("trailing input after statement"));
    }
    Ok(stmt)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end_offset: usize,
    next_param: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.offset)
            .unwrap_or(self.end_offset)
    }

    fn error_here(&self, message: impl Into<String>) -> KuraError {
        KuraError::Parse {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn skip(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<()> {
        if self.skip(tok) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected {}", what)))
        }
    }

    /// Case-insensitive keyword check.
    fn peek_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn skip_kw(&mut self, kw: &str) -> bool {
        if self.peek_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.skip_kw(kw) {
            Ok(())
        } else {
            Err(self.error_here(format!("expected {}", kw)))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(Tok::Ident(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.error_here(format!("expected {}", what))),
        }
    }

    // --- Statements ---

    fn parse_statement(&mut self) -> Result<Statement> {
        if self.skip_kw("CREATE") {
            if self.peek_kw("TABLE") {
                return self.parse_create_table();
            }
            return self.parse_create_index();
        }
        if self.skip_kw("DROP") {
            return self.parse_drop_table();
        }
        if self.skip_kw("INSERT") {
            return self.parse_insert();
        }
        if self.skip_kw("SELECT") {
            return self.parse_select();
        }
        if self.skip_kw("UPDATE") {
            return self.parse_update();
        }
        if self.skip_kw("DELETE") {
            return self.parse_delete();
        }
        if self.skip_kw("BEGIN") {
            self.skip_kw("TRANSACTION");
            return Ok(Statement::Begin);
        }
        if self.skip_kw("COMMIT") {
            return Ok(Statement::Commit);
        }
        if self.skip_kw("ROLLBACK") {
            return Ok(Statement::Rollback);
        }
        Err(self.error_here("expected a statement"))
    }

    fn parse_if_not_exists(&mut self) -> Result<bool> {
        if self.skip_kw("IF") {
            self.expect_kw("NOT")?;
            self.expect_kw("EXISTS")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse_create_table(&mut self) -> Result<Statement> {
        self.expect_kw("TABLE")?;
        let if_not_exists = self.parse_if_not_exists()?;
        let table_name = self.expect_ident("table name")?;
        self.expect(&Tok::LParen, "'('")?;

        let mut columns = Vec::new();
        loop {
            let name = self.expect_ident("column name")?;
            let data_type = self.parse_data_type()?;
            let mut primary_key = false;
            let mut not_null = false;
            loop {
                if self.skip_kw("PRIMARY") {
                    self.expect_kw("KEY")?;
                    primary_key = true;
                } else if self.skip_kw("NOT") {
                    self.expect_kw("NULL")?;
                    not_null = true;
                } else {
                    break;
                }
            }
            columns.push(ColumnSpec {
                name,
                data_type,
                primary_key,
                not_null,
            });
            if !self.skip(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RParen, "')'")?;
        if columns.is_empty() {
            return Err(self.error_here("table needs at least one column"));
        }
        Ok(Statement::CreateTable(CreateTable {
            table_name,
            columns,
            if_not_exists,
        }))
    }

    fn parse_data_type(&mut self) -> Result<DataType> {
        let name = self.expect_ident("column type")?;
        match name.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" => Ok(DataType::Integer),
            "REAL" | "DOUBLE" | "FLOAT" => Ok(DataType::Real),
            "TEXT" | "VARCHAR" | "CHAR" => Ok(DataType::Text),
            "BLOB" => Ok(DataType::Blob),
            other => Err(self.error_here(format!("unknown column type {}", other))),
        }
    }

    fn parse_create_index(&mut self) -> Result<Statement> {
        let unique = self.skip_kw("UNIQUE");
        self.expect_kw("INDEX")?;
        let if_not_exists = self.parse_if_not_exists()?;
        let index_name = self.expect_ident("index name")?;
        self.expect_kw("ON")?;
        let table_name = self.expect_ident("table name")?;
        self.expect(&Tok::LParen, "'('")?;
        let column_name = self.expect_ident("column name")?;
        self.expect(&Tok::RParen, "')'")?;
        Ok(Statement::CreateIndex(CreateIndex {
            index_name,
            table_name,
            column_name,
            unique,
            if_not_exists,
        }))
    }

    fn parse_drop_table(&mut self) -> Result<Statement> {
        self.expect_kw("TABLE")?;
        let if_exists = if self.skip_kw("IF") {
            self.expect_kw("EXISTS")?;
            true
        } else {
            false
        };
        let table_name = self.expect_ident("table name")?;
        Ok(Statement::DropTable(DropTable {
            table_name,
            if_exists,
        }))
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect_kw("INTO")?;
        let table_name = self.expect_ident("table name")?;

        let columns = if self.skip(&Tok::LParen) {
            let mut cols = Vec::new();
            loop {
                cols.push(self.expect_ident("column name")?);
                if !self.skip(&Tok::Comma) {
                    break;
                }
            }
            self.expect(&Tok::RParen, "')'")?;
            Some(cols)
        } else {
            None
        };

        self.expect_kw("VALUES")?;
        let mut rows = Vec::new();
        loop {
            self.expect(&Tok::LParen, "'('")?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_expr()?);
                if !self.skip(&Tok::Comma) {
                    break;
                }
            }
            self.expect(&Tok::RParen, "')'")?;
            rows.push(row);
            if !self.skip(&Tok::Comma) {
                break;
            }
        }
        Ok(Statement::Insert(Insert {
            table_name,
            columns,
            rows,
        }))
    }

    fn parse_select(&mut self) -> Result<Statement> {
        let mut columns = Vec::new();
        loop {
            if self.skip(&Tok::Star) {
                columns.push(SelectColumn::Star);
            } else if self.peek_kw("COUNT") {
                self.pos += 1;
                self.expect(&Tok::LParen, "'('")?;
                self.expect(&Tok::Star, "'*'")?;
                self.expect(&Tok::RParen, "')'")?;
                columns.push(SelectColumn::CountStar);
            } else {
                let expr = self.parse_expr()?;
                let alias = if self.skip_kw("AS") {
                    Some(self.expect_ident("alias")?)
                } else {
                    None
                };
                columns.push(SelectColumn::Expr(expr, alias));
            }
            if !self.skip(&Tok::Comma) {
                break;
            }
        }

        self.expect_kw("FROM")?;
        let table_name = self.expect_ident("table name")?;
        let where_clause = self.parse_where()?;
        Ok(Statement::Select(Select {
            columns,
            table_name,
            where_clause,
        }))
    }

    fn parse_update(&mut self) -> Result<Statement> {
        let table_name = self.expect_ident("table name")?;
        self.expect_kw("SET")?;
        let mut assignments = Vec::new();
        loop {
            let col = self.expect_ident("column name")?;
            self.expect(&Tok::Eq, "'='")?;
            assignments.push((col, self.parse_expr()?));
            if !self.skip(&Tok::Comma) {
                break;
            }
        }
        let where_clause = self.parse_where()?;
        Ok(Statement::Update(Update {
            table_name,
            assignments,
            where_clause,
        }))
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect_kw("FROM")?;
        let table_name = self.expect_ident("table name")?;
        let where_clause = self.parse_where()?;
        Ok(Statement::Delete(Delete {
            table_name,
            where_clause,
        }))
    }

    fn parse_where(&mut self) -> Result<Option<Expr>> {
        if self.skip_kw("WHERE") {
            Ok(Some(self.parse_expr()?))
        } else {
            Ok(None)
        }
    }

    // --- Expressions (precedence climbing) ---

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.skip_kw("OR") {
            let right = self.parse_and()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.skip_kw("AND") {
            let right = self.parse_not()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.skip_kw("NOT") {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;

        // IS [NOT] NULL
        if self.skip_kw("IS") {
            let negated = self.skip_kw("NOT");
            self.expect_kw("NULL")?;
            return Ok(Expr::IsNull {
                operand: Box::new(left),
                negated,
            });
        }

        let op = match self.peek() {
            Some(Tok::Eq) => Some(BinaryOp::Eq),
            Some(Tok::Ne) => Some(BinaryOp::Ne),
            Some(Tok::Lt) => Some(BinaryOp::Lt),
            Some(Tok::Le) => Some(BinaryOp::Le),
            Some(Tok::Gt) => Some(BinaryOp::Gt),
            Some(Tok::Ge) => Some(BinaryOp::Ge),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let right = self.parse_additive()?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                })
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinaryOp::Add,
                Some(Tok::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinaryOp::Mul,
                Some(Tok::Slash) => BinaryOp::Div,
                Some(Tok::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.skip(&Tok::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.skip(&Tok::Plus) {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Tok::Int(v)) => Ok(Expr::Literal(Value::Integer(v))),
            Some(Tok::Float(v)) => Ok(Expr::Literal(Value::Real(v))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::Text(s))),
            Some(Tok::Blob(b)) => Ok(Expr::Literal(Value::Blob(b))),
            Some(Tok::Param(explicit)) => {
                let slot = match explicit {
                    Some(n) => {
                        self.next_param = self.next_param.max(n + 1);
                        n
                    }
                    None => {
                        let slot = self.next_param;
                        self.next_param += 1;
                        slot
                    }
                };
                Ok(Expr::Param(slot))
            }
            Some(Tok::Ident(name)) => {
                if name.eq_ignore_ascii_case("NULL") {
                    Ok(Expr::Literal(Value::Null))
                } else if name.eq_ignore_ascii_case("TRUE") {
                    Ok(Expr::Literal(Value::Integer(1)))
                } else if name.eq_ignore_ascii_case("FALSE") {
                    Ok(Expr::Literal(Value::Integer(0)))
                } else if RESERVED.iter().any(|kw| name.eq_ignore_ascii_case(kw)) {
                    self.pos -= 1;
                    Err(self.error_here("expected an expression"))
                } else {
                    Ok(Expr::Column(name))
                }
            }
            Some(Tok::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(expr)
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error_here("expected an expression"))
            }
        }
    }
}
