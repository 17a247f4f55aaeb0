//! Expression evaluation with SQL three-valued logic.
//!
//! Any comparison involving NULL yields NULL; NULL propagates through
//! arithmetic; AND/OR follow Kleene logic. Booleans are represented as
//! Integer(0)/Integer(1). Division by zero yields NULL.

use crate::error::{KuraError, Result};
use crate::sql::ast::{BinaryOp, Expr, UnaryOp};
use crate::types::Value;

/// Column environment for the current row.
pub struct RowContext<'a> {
    pub columns: &'a [String],
    pub values: &'a [Value],
}

impl RowContext<'_> {
    fn get(&self, name: &str) -> Result<Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(|i| self.values[i].clone())
            .ok_or_else(|| KuraError::Schema(format!("no such column: {}", name)))
    }
}

pub fn eval(expr: &Expr, row: Option<&RowContext<'_>>, params: &[Value]) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(name) => match row {
            Some(ctx) => ctx.get(name),
            None => Err(KuraError::Schema(format!(
                "column {} referenced outside a row context",
                name
            ))),
        },
        Expr::Param(slot) => Ok(params.get(*slot).cloned().unwrap_or(Value::Null)),
        Expr::Binary { left, op, right } => {
            let l = eval(left, row, params)?;
            // Short-circuit AND/OR before evaluating the right side.
            match op {
                BinaryOp::And if l == Value::Integer(0) => return Ok(Value::Integer(0)),
                BinaryOp::Or if is_true(&l) => return Ok(Value::Integer(1)),
                _ => {}
            }
            let r = eval(right, row, params)?;
            eval_binary(*op, l, r)
        }
        Expr::Unary { op, operand } => {
            let v = eval(operand, row, params)?;
            match op {
                UnaryOp::Not => Ok(match bool3(&v)? {
                    Some(b) => Value::Integer(!b as i64),
                    None => Value::Null,
                }),
                UnaryOp::Neg => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Integer(n) => n
                        .checked_neg()
                        .map(Value::Integer)
                        .ok_or_else(|| KuraError::Schema("integer overflow".into())),
                    Value::Real(f) => Ok(Value::Real(-f)),
                    other => Err(KuraError::Schema(format!("cannot negate {}", other))),
                },
            }
        }
        Expr::IsNull { operand, negated } => {
            let v = eval(operand, row, params)?;
            let is_null = v.is_null();
            Ok(Value::Integer((is_null != *negated) as i64))
        }
    }
}

/// Truthiness for filters: only a definite true passes.
pub fn is_true(value: &Value) -> bool {
    match value {
        Value::Integer(v) => *v != 0,
        Value::Real(v) => *v != 0.0,
        _ => false,
    }
}

/// Three-valued boolean view of a value.
fn bool3(value: &Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(v) => Ok(Some(*v != 0)),
        Value::Real(v) => Ok(Some(*v != 0.0)),
        other => Err(KuraError::Schema(format!("{} is not a boolean", other))),
    }
}

fn eval_binary(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    use BinaryOp::*;
    match op {
        And | Or => {
            let lb = bool3(&l)?;
            let rb = bool3(&r)?;
            let out = match op {
                And => match (lb, rb) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                },
                _ => match (lb, rb) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                },
            };
            Ok(match out {
                Some(b) => Value::Integer(b as i64),
                None => Value::Null,
            })
        }
        Eq | Ne | Lt | Le | Gt | Ge => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ord = compare_values(&l, &r)?;
            let b = match op {
                Eq => ord == std::cmp::Ordering::Equal,
                Ne => ord != std::cmp::Ordering::Equal,
                Lt => ord == std::cmp::Ordering::Less,
                Le => ord != std::cmp::Ordering::Greater,
                Gt => ord == std::cmp::Ordering::Greater,
                Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Integer(b as i64))
        }
        Add | Sub | Mul | Div | Mod => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            arith(op, l, r)
        }
    }
}

/// Ordering between two non-NULL values; numeric types compare across
/// Integer/Real, everything else requires matching types.
pub fn compare_values(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    use std::cmp::Ordering;
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => Ok(a.cmp(b)),
        (Value::Real(a), Value::Real(b)) => Ok(a.partial_cmp(b).unwrap_or(Ordering::Equal)),
        (Value::Integer(a), Value::Real(b)) => {
            Ok((*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal))
        }
        (Value::Real(a), Value::Integer(b)) => {
            Ok(a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal))
        }
        (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
        (Value::Blob(a), Value::Blob(b)) => Ok(a.cmp(b)),
        _ => Err(KuraError::Schema(format!(
            "cannot compare {} with {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "NULL",
        Value::Integer(_) => "INTEGER",
        Value::Real(_) => "REAL",
        Value::Text(_) => "TEXT",
        Value::Blob(_) => "BLOB",
    }
}

fn arith(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    use BinaryOp::*;
    match (&l, &r) {
        (Value::Integer(a), Value::Integer(b)) => {
            let (a, b) = (*a, *b);
            let out = match op {
                Add => a.checked_add(b),
                Sub => a.checked_sub(b),
                Mul => a.checked_mul(b),
                Div => {
                    if b == 0 {
                        return Ok(Value::Null);
                    }
                    a.checked_div(b)
                }
                Mod => {
                    if b == 0 {
                        return Ok(Value::Null);
                    }
                    a.checked_rem(b)
                }
                _ => unreachable!(),
            };
            out.map(Value::Integer)
                .ok_or_else(|| KuraError::Schema("integer overflow".into()))
        }
        _ => {
            let a = as_f64(&l)?;
            let b = as_f64(&r)?;
            let out = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => {
                    if b == 0.0 {
                        return Ok(Value::Null);
                    }
                    a / b
                }
                Mod => {
                    if b == 0.0 {
                        return Ok(Value::Null);
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(Value::Real(out))
        }
    }
}

fn as_f64(v: &Value) -> Result<f64> {
    match v {
        Value::Integer(n) => Ok(*n as f64),
        Value::Real(f) => Ok(*f),
        other => Err(KuraError::Schema(format!(
            "{} is not numeric",
            type_name(other)
        ))),
    }
}
