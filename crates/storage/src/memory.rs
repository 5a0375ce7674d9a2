//! In-memory backend over a `BTreeMap`. Volatile but fast for testing.

use crate::backend::{BatchOp, Database, DbIter, WriteBatch};
use canopy_types::StorageError;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

/// An in-memory [`Database`].
///
/// Range scans snapshot the matching entries at call time.
#[derive(Debug, Default)]
pub struct MemDb {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Database for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.read().contains_key(key))
    }

    fn iter_range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<DbIter<'_>, StorageError> {
        let map = self.read();
        let end_bound = match end {
            Some(e) => Bound::Excluded(e),
            None => Bound::Unbounded,
        };
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = map
            .range::<[u8], _>((Bound::Included(start), end_bound))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if reverse {
            items.reverse();
        }
        Ok(Box::new(items.into_iter().map(Ok)))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        for op in batch.into_ops() {
            match op {
                BatchOp::Set(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let db = MemDb::new();
        let mut batch = WriteBatch::new();
        batch.set(b"a".to_vec(), b"1".to_vec());
        batch.set(b"a".to_vec(), b"2".to_vec());
        batch.set(b"b".to_vec(), b"3".to_vec());
        batch.delete(b"b".to_vec());
        db.write(batch).unwrap();

        assert_eq!(db.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), None);
    }

    #[test]
    fn range_scan_is_ordered_and_half_open() {
        let db = MemDb::new();
        let mut batch = WriteBatch::new();
        for k in [b"a", b"b", b"c", b"d"] {
            batch.set(k.to_vec(), k.to_vec());
        }
        db.write(batch).unwrap();

        let keys: Vec<Vec<u8>> = db
            .iter_range(b"b", Some(b"d"), false)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let rev: Vec<Vec<u8>> = db
            .iter_range(b"a", None, true)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(
            rev,
            vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
    }
}
