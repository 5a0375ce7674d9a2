//! The opaque ordered byte store the node store is layered on.

use canopy_types::StorageError;

/// A single pending mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Set(Vec<u8>, Vec<u8>),
    /// Remove a key; removing an absent key is a no-op.
    Delete(Vec<u8>),
}

/// An ordered list of mutations applied atomically by [`Database::write`].
///
/// Operations are applied in insertion order, so a `Set` followed by a
/// `Delete` of the same key leaves the key absent.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an insert/overwrite.
    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Set(key.into(), value.into()));
    }

    /// Queue a removal.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    /// Whether any operation is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Consume the batch, yielding its operations in order.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Iterator over `(key, value)` pairs of a range scan.
///
/// Implementations may snapshot the range at creation time; entries written
/// after the iterator was obtained are not guaranteed to appear.
pub type DbIter<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StorageError>> + 'a>;

/// An opaque, ordered byte store with atomic batch commit.
///
/// Keys are ordered lexicographically. A committed batch becomes visible to
/// readers in its entirety or not at all; that commit is the only atomicity
/// boundary the tree relies on.
pub trait Database: Send + Sync {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Existence check; the default routes through [`Database::get`].
    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Scan `[start, end)` in key order, or backwards when `reverse` is set.
    /// `end = None` means "to the end of the keyspace".
    fn iter_range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<DbIter<'_>, StorageError>;

    /// Apply a batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<(), StorageError>;
}
