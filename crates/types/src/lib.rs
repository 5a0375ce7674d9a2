#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Core data structures, error types, and configs for the canopy versioned
//! state store.

pub mod config;
pub mod error;
pub mod hash;

pub use config::TreeOptions;
pub use error::{StorageError, TreeError};
pub use hash::{empty_root_hash, NodeHash, RootHash, HASH_SIZE};

/// Monotonically increasing tag attached to a committed tree snapshot.
///
/// Saved versions are strictly positive; the working tree is conceptually at
/// `last saved + 1`.
pub type Version = i64;
