//! Flat-index entries: the live value for a key plus the version that last
//! touched it.

use canopy_types::Version;

/// One fast-index entry. There is at most one per live key across all saved
/// versions; every write overwrites it, so `version_last_updated_at` always
/// names the latest version that changed the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FastNode {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
    pub(crate) version_last_updated_at: Version,
}

impl FastNode {
    pub(crate) fn new(key: Vec<u8>, value: Vec<u8>, version: Version) -> Self {
        Self {
            key,
            value,
            version_last_updated_at: version,
        }
    }
}
