use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One cell of a stored row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Reals, and integers widened to reals.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

pub type Row = Vec<Value>;

/// Row id assigned by the store on insert, starting at 1.
pub type RowId = i64;

pub type RowIter<'a> = Box<dyn Iterator<Item = (RowId, &'a Row)> + 'a>;

/// Pseudo-column naming the row id in [`TableStore::delete_where`].
pub const ROWID_COLUMN: &str = "rowid";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path} is malformed: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no such table: {0}")]
    MissingTable(String),
    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },
    #[error("table {table} expects {expected} values, got {found}")]
    Arity {
        table: String,
        found: usize,
        expected: usize,
    },
    #[error("table {table} already exists with columns {existing:?}")]
    Schema {
        table: String,
        existing: Vec<String>,
    },
    #[error("a batch is already open")]
    BatchOpen,
    #[error("no batch is open")]
    NoBatch,
}

/// Row-oriented persistence transport.
///
/// This is the narrow contract the tree, cluster and visual-object tables
/// are written against: named tables of positional rows, batched writes,
/// and a cursor over stored rows. Any key-value or SQL store satisfies it.
pub trait TableStore: Send {
    /// Creates the table if missing. An existing table must have the same columns.
    fn ensure_table(&mut self, name: &str, columns: &[&str]) -> Result<(), StoreError>;

    fn has_table(&self, name: &str) -> bool;

    /// Deletes every row but keeps the table and its row id counter.
    fn clear_table(&mut self, name: &str) -> Result<(), StoreError>;

    /// Opens a batch. Mutations until `commit` apply atomically.
    fn begin(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discards every mutation since `begin`.
    fn rollback(&mut self) -> Result<(), StoreError>;

    fn in_batch(&self) -> bool;

    fn insert(&mut self, table: &str, row: Row) -> Result<RowId, StoreError>;

    /// Rows in insertion order.
    fn rows<'a>(&'a self, table: &str) -> Result<RowIter<'a>, StoreError>;

    /// Deletes rows whose `column` equals `value`, returning how many went.
    /// [`ROWID_COLUMN`] matches the row id itself.
    fn delete_where(
        &mut self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widens_to_real() {
        assert_eq!(Value::Integer(3).as_real(), Some(3.0));
        assert_eq!(Value::Real(2.5).as_integer(), None);
    }

    #[test]
    fn test_accessors_reject_other_variants() {
        assert_eq!(Value::Null.as_text(), None);
        assert_eq!(Value::from("abc").as_text(), Some("abc"));
        assert_eq!(Value::from(vec![1u8, 2]).as_blob(), Some(&[1u8, 2][..]));
        assert_eq!(Value::from(7u32), Value::Integer(7));
    }

    #[test]
    fn test_value_survives_json() {
        let row: Row = vec![
            Value::Null,
            Value::Integer(-4),
            Value::Real(0.5),
            Value::from("x"),
            Value::Blob(vec![0, 255]),
        ];
        let json = serde_json::to_string(&row).unwrap();
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }
}
