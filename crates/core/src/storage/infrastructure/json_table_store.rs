use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::domain::table_store::{Row, RowId, RowIter, StoreError, TableStore, Value};
use crate::storage::infrastructure::memory_table_store::{MemoryTableStore, Tables};

/// Table store persisted as one JSON document.
///
/// The whole document is rewritten on `commit` and after every mutation
/// made outside a batch, so the file always reflects committed state.
pub struct JsonTableStore {
    path: PathBuf,
    inner: MemoryTableStore,
}

impl JsonTableStore {
    /// Opens `path`, creating an empty store if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let inner = if path.exists() {
            let json = fs::read_to_string(path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let tables: Tables =
                serde_json::from_str(&json).map_err(|source| StoreError::Format {
                    path: path.to_path_buf(),
                    source,
                })?;
            MemoryTableStore::from_tables(tables)
        } else {
            MemoryTableStore::new()
        };
        log::debug!("Opened table store {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let json = serde_json::to_string(self.inner.tables()).map_err(|source| {
            StoreError::Format {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, json).map_err(io_err)
    }

    fn flush_outside_batch(&self) -> Result<(), StoreError> {
        if self.inner.in_batch() {
            Ok(())
        } else {
            self.flush()
        }
    }
}

impl TableStore for JsonTableStore {
    fn ensure_table(&mut self, name: &str, columns: &[&str]) -> Result<(), StoreError> {
        let existed = self.inner.has_table(name);
        self.inner.ensure_table(name, columns)?;
        if existed {
            Ok(())
        } else {
            self.flush_outside_batch()
        }
    }

    fn has_table(&self, name: &str) -> bool {
        self.inner.has_table(name)
    }

    fn clear_table(&mut self, name: &str) -> Result<(), StoreError> {
        self.inner.clear_table(name)?;
        self.flush_outside_batch()
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.inner.commit()?;
        self.flush()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.inner.rollback()
    }

    fn in_batch(&self) -> bool {
        self.inner.in_batch()
    }

    fn insert(&mut self, table: &str, row: Row) -> Result<RowId, StoreError> {
        let id = self.inner.insert(table, row)?;
        self.flush_outside_batch()?;
        Ok(id)
    }

    fn rows<'a>(&'a self, table: &str) -> Result<RowIter<'a>, StoreError> {
        self.inner.rows(table)
    }

    fn delete_where(
        &mut self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<usize, StoreError> {
        let removed = self.inner.delete_where(table, column, value)?;
        if removed > 0 {
            self.flush_outside_batch()?;
        }
        Ok(removed)
    }
}
