//! 32-byte hash newtypes shared by the tree and its node store.

use sha2::{Digest, Sha256};

/// Byte length of every hash handled by the store.
pub const HASH_SIZE: usize = 32;

/// A 32-byte state root hash, committing to the entire key-value set at one
/// version.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHash(pub [u8; HASH_SIZE]);

impl std::fmt::Debug for RootHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RootHash({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for RootHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl AsRef<[u8]> for RootHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<NodeHash> for RootHash {
    fn from(h: NodeHash) -> Self {
        RootHash(h.0)
    }
}

/// A 32-byte content-addressed hash of a tree node's canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHash(pub [u8; HASH_SIZE]);

impl std::fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeHash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for NodeHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The canonical root hash of an empty tree: SHA-256 of the empty input.
pub fn empty_root_hash() -> RootHash {
    RootHash(Sha256::digest([]).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_hash_is_sha256_of_nothing() {
        // Well-known SHA-256("") digest.
        assert_eq!(
            empty_root_hash().to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
