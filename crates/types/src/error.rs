//! Error types shared across the store.

use crate::hash::RootHash;
use crate::Version;
use thiserror::Error;

/// Errors originating in the ordered byte store underneath the tree.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A generic error from the underlying key-value backend (e.g. redb).
    #[error("backend error: {0}")]
    Backend(String),
    /// An error occurred while serializing data for storage.
    #[error("encode error: {0}")]
    Encode(String),
    /// An error occurred while deserializing data from storage.
    #[error("decode error: {0}")]
    Decode(String),
    /// The requested key or item was not found in the store.
    #[error("not found")]
    NotFound,
}

/// Errors surfaced by the versioned tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// The requested version was never saved, or has been deleted.
    #[error("version does not exist")]
    VersionDoesNotExist,
    /// A specific version was requested but only another one is available.
    #[error("wanted to load target {target} but only found up to {latest}")]
    VersionMismatch {
        /// The version the caller asked for.
        target: Version,
        /// The greatest version actually available.
        latest: Version,
    },
    /// Saving would overwrite an existing version with different contents.
    #[error("version {version} was already saved to different hash {new} (existing hash {existing})")]
    OverwriteMismatch {
        /// The colliding version.
        version: Version,
        /// Root hash already recorded for that version.
        existing: RootHash,
        /// Root hash of the working tree.
        new: RootHash,
    },
    /// The store holds a version below the configured initial version.
    #[error("initial version set to {configured}, but found earlier version {found}")]
    InitialVersionViolation {
        /// The earliest version found in the store.
        found: Version,
        /// The configured initial version.
        configured: u64,
    },
    /// Keys are opaque but must be non-empty.
    #[error("keys must be non-empty")]
    EmptyKey,
    /// The latest saved version can never be deleted.
    #[error("cannot delete latest saved version ({0})")]
    CannotDeleteLatest(Version),
    /// Saved versions are strictly positive.
    #[error("version must be greater than 0")]
    NonPositiveVersion,
    /// A version range whose bounds are out of order or empty.
    #[error("invalid version range [{from}, {to})")]
    InvalidRange {
        /// Inclusive lower bound.
        from: Version,
        /// Exclusive upper bound.
        to: Version,
    },
    /// A failure in the node store or its backend.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
