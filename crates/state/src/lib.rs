#![forbid(unsafe_code)]

//! A versioned, hash-authenticated, persistent key-value store.
//!
//! The store is a copy-on-write AVL tree over a content-addressed node
//! store. Every save produces a new version with a single 32-byte root hash
//! committing to the entire key-value set; old versions stay readable until
//! explicitly deleted. A flat fast index sits next to the tree for O(1)
//! point reads and linear ordered scans of the live state.
//!
//! [`MutableTree`] is the single-writer working tree; [`ImmutableTree`] is a
//! read-only view of one version, safe to read concurrently while that
//! version exists.
//!
//! ```no_run
//! use canopy_state::MutableTree;
//! use canopy_storage::MemDb;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), canopy_state::TreeError> {
//! let mut tree = MutableTree::new(Arc::new(MemDb::new()), 10_000)?;
//! tree.set(b"alpha", b"1")?;
//! let (root, version) = tree.save_version()?;
//! assert_eq!(version, 1);
//! assert_eq!(tree.get(b"alpha")?, Some(b"1".to_vec()));
//! # let _ = root;
//! # Ok(())
//! # }
//! ```

mod encode;
mod fast_node;
mod immutable;
mod iterator;
mod memory;
mod mutable;
mod node;
mod node_db;

pub use immutable::ImmutableTree;
pub use iterator::{IterItem, MergedIterator, TreeIterator};
pub use mutable::MutableTree;

pub use canopy_types::{
    empty_root_hash, NodeHash, RootHash, StorageError, TreeError, TreeOptions, Version,
};

#[cfg(test)]
mod tests;
