//! Durable backend on redb: one ordered table, batch-per-write-transaction.

use crate::backend::{BatchOp, Database, DbIter, WriteBatch};
use canopy_types::StorageError;
use redb::{ReadableTable, TableDefinition};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("KV");

/// A [`Database`] persisted in a single redb file.
#[derive(Clone)]
pub struct RedbDb {
    db: Arc<redb::Database>,
}

impl RedbDb {
    /// Open (or create) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = redb::Database::create(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        // Ensure the table exists so read transactions never miss it.
        {
            let w = db
                .begin_write()
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            {
                w.open_table(KV)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
            }
            w.commit()
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(Self { db: Arc::new(db) })
    }
}

impl Database for RedbDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let r = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let t = r
            .open_table(KV)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let value = t
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn iter_range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<DbIter<'_>, StorageError> {
        let r = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let t = r
            .open_table(KV)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let end_bound = match end {
            Some(e) => Bound::Excluded(e),
            None => Bound::Unbounded,
        };
        // Collected eagerly: the read transaction cannot outlive this call.
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let range = t
            .range::<&[u8]>((Bound::Included(start), end_bound))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        for entry in range {
            let (k, v) = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
            items.push((k.value().to_vec(), v.value().to_vec()));
        }
        if reverse {
            items.reverse();
        }
        Ok(Box::new(items.into_iter().map(Ok)))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let w = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        {
            let mut t = w
                .open_table(KV)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Set(k, v) => {
                        t.insert(k.as_slice(), v.as_slice())
                            .map_err(|e| StorageError::Backend(e.to_string()))?;
                    }
                    BatchOp::Delete(k) => {
                        t.remove(k.as_slice())
                            .map_err(|e| StorageError::Backend(e.to_string()))?;
                    }
                }
            }
        }
        w.commit().map_err(|e| StorageError::Backend(e.to_string()))
    }
}
