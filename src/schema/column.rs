//! Table, column and index definitions.
//!
//! Definitions serialize through the row codec so the catalog stores them
//! like any other row payload.

use crate::error::{KuraError, Result};
use crate::storage::page::PageId;
use crate::types::{DataType, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub primary_key: bool,
    pub not_null: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub root: PageId,
    pub next_rowid: i64,
    /// Column index of an INTEGER PRIMARY KEY, which doubles as the rowid.
    pub rowid_pk: Option<usize>,
}

impl TableDef {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn type_tag(dt: DataType) -> i64 {
        match dt {
            DataType::Integer => 1,
            DataType::Real => 2,
            DataType::Text => 3,
            DataType::Blob => 4,
        }
    }

    fn type_from_tag(tag: i64) -> Result<DataType> {
        match tag {
            1 => Ok(DataType::Integer),
            2 => Ok(DataType::Real),
            3 => Ok(DataType::Text),
            4 => Ok(DataType::Blob),
            _ => Err(KuraError::Corruption(format!("unknown type tag {}", tag))),
        }
    }

    pub fn to_values(&self) -> Vec<Value> {
        let mut values = vec![
            Value::Text(self.name.clone()),
            Value::Integer(self.root as i64),
            Value::Integer(self.next_rowid),
            Value::Integer(self.rowid_pk.map(|i| i as i64).unwrap_or(-1)),
            Value::Integer(self.columns.len() as i64),
        ];
        for col in &self.columns {
            values.push(Value::Text(col.name.clone()));
            values.push(Value::Integer(Self::type_tag(col.data_type)));
            values.push(Value::Integer(col.primary_key as i64));
            values.push(Value::Integer(col.not_null as i64));
        }
        values
    }

    pub fn from_values(values: &[Value]) -> Result<Self> {
        let corrupt = || KuraError::Corruption("malformed table definition".into());
        let name = values.first().and_then(|v| v.as_str()).ok_or_else(corrupt)?;
        let root = values.get(1).and_then(|v| v.as_i64()).ok_or_else(corrupt)?;
        let next_rowid = values.get(2).and_then(|v| v.as_i64()).ok_or_else(corrupt)?;
        let rowid_pk = values.get(3).and_then(|v| v.as_i64()).ok_or_else(corrupt)?;
        let ncols = values.get(4).and_then(|v| v.as_i64()).ok_or_else(corrupt)? as usize;

        let mut columns = Vec::with_capacity(ncols);
        for i in 0..ncols {
            let base = 5 + i * 4;
            columns.push(ColumnDef {
                name: values
                    .get(base)
                    .and_then(|v| v.as_str())
                    .ok_or_else(corrupt)?
                    .to_string(),
                data_type: Self::type_from_tag(
                    values.get(base + 1).and_then(|v| v.as_i64()).ok_or_else(corrupt)?,
                )?,
                primary_key: values.get(base + 2).and_then(|v| v.as_i64()).ok_or_else(corrupt)?
                    != 0,
                not_null: values.get(base + 3).and_then(|v| v.as_i64()).ok_or_else(corrupt)?
                    != 0,
            });
        }

        Ok(TableDef {
            name: name.to_string(),
            columns,
            root: root as PageId,
            next_rowid,
            rowid_pk: if rowid_pk < 0 { None } else { Some(rowid_pk as usize) },
        })
    }

    /// Render as CREATE TABLE text (CLI `.schema`).
    pub fn to_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut s = format!("{} {}", c.name, c.data_type);
                if c.primary_key {
                    s.push_str(" PRIMARY KEY");
                }
                if c.not_null && !c.primary_key {
                    s.push_str(" NOT NULL");
                }
                s
            })
            .collect();
        format!("CREATE TABLE {}({})", self.name, cols.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    /// Index of the covered column in the table definition.
    pub column: usize,
    pub unique: bool,
    pub root: PageId,
}

impl IndexDef {
    pub fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.name.clone()),
            Value::Text(self.table.clone()),
            Value::Integer(self.column as i64),
            Value::Integer(self.unique as i64),
            Value::Integer(self.root as i64),
        ]
    }

    pub fn from_values(values: &[Value]) -> Result<Self> {
        let corrupt = || KuraError::Corruption("malformed index definition".into());
        Ok(IndexDef {
            name: values
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(corrupt)?
                .to_string(),
            table: values
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or_else(corrupt)?
                .to_string(),
            column: values.get(2).and_then(|v| v.as_i64()).ok_or_else(corrupt)? as usize,
            unique: values.get(3).and_then(|v| v.as_i64()).ok_or_else(corrupt)? != 0,
            root: values.get(4).and_then(|v| v.as_i64()).ok_or_else(corrupt)? as PageId,
        })
    }

    pub fn to_sql(&self, column_name: &str) -> String {
        format!(
            "CREATE {}INDEX {} ON {}({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            column_name
        )
    }
}
