use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::domain::table_store::{
    Row, RowId, RowIter, StoreError, TableStore, Value, ROWID_COLUMN,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Table {
    columns: Vec<String>,
    next_rowid: RowId,
    rows: BTreeMap<RowId, Row>,
}

pub(crate) type Tables = BTreeMap<String, Table>;

/// Volatile table store. Batches snapshot all tables at `begin`.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Tables,
    snapshot: Option<Tables>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Self {
            tables,
            snapshot: None,
        }
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn row_count(&self, table: &str) -> Result<usize, StoreError> {
        Ok(self.table(table)?.rows.len())
    }

    fn table(&self, name: &str) -> Result<&Table, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::MissingTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, StoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::MissingTable(name.to_string()))
    }
}

impl TableStore for MemoryTableStore {
    fn ensure_table(&mut self, name: &str, columns: &[&str]) -> Result<(), StoreError> {
        if let Some(existing) = self.tables.get(name) {
            if existing.columns.iter().map(String::as_str).ne(columns.iter().copied()) {
                return Err(StoreError::Schema {
                    table: name.to_string(),
                    existing: existing.columns.clone(),
                });
            }
            return Ok(());
        }
        self.tables.insert(
            name.to_string(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                next_rowid: 1,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    fn clear_table(&mut self, name: &str) -> Result<(), StoreError> {
        self.table_mut(name)?.rows.clear();
        Ok(())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::BatchOpen);
        }
        self.snapshot = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.snapshot.take().map(|_| ()).ok_or(StoreError::NoBatch)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let snapshot = self.snapshot.take().ok_or(StoreError::NoBatch)?;
        self.tables = snapshot;
        Ok(())
    }

    fn in_batch(&self) -> bool {
        self.snapshot.is_some()
    }

    fn insert(&mut self, table: &str, row: Row) -> Result<RowId, StoreError> {
        let t = self.table_mut(table)?;
        if row.len() != t.columns.len() {
            return Err(StoreError::Arity {
                table: table.to_string(),
                found: row.len(),
                expected: t.columns.len(),
            });
        }
        let rowid = t.next_rowid;
        t.next_rowid += 1;
        t.rows.insert(rowid, row);
        Ok(rowid)
    }

    fn rows<'a>(&'a self, table: &str) -> Result<RowIter<'a>, StoreError> {
        let t = self.table(table)?;
        Ok(Box::new(t.rows.iter().map(|(id, row)| (*id, row))))
    }

    fn delete_where(
        &mut self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<usize, StoreError> {
        let t = self.table_mut(table)?;
        let before = t.rows.len();
        if column == ROWID_COLUMN {
            if let Some(id) = value.as_integer() {
                t.rows.remove(&id);
            }
            return Ok(before - t.rows.len());
        }
        let col = t
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| StoreError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })?;
        t.rows.retain(|_, row| row.get(col) != Some(value));
        Ok(before - t.rows.len())
    }
}
