//! Tree nodes and child references.

use crate::encode;
use canopy_types::{NodeHash, TreeError, Version};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Reference from an inner node to a child: the hash of a persisted node,
/// to be materialized through the node store, or the child itself while the
/// freshly built spine is still in memory.
#[derive(Debug, Clone)]
pub(crate) enum ChildRef {
    Hash(NodeHash),
    Node(Arc<Node>),
}

/// A single tree node. Leaves carry the value; inner nodes carry the pivot
/// key, the smallest key of their right subtree.
///
/// Once `persisted` is set the node is immutable; [`Node::clone_for_update`]
/// is the only way to derive a mutable copy of it.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) key: Vec<u8>,
    /// Present iff this is a leaf.
    pub(crate) value: Option<Vec<u8>>,
    /// Version the node was created at.
    pub(crate) version: Version,
    /// 0 for leaves.
    pub(crate) height: i8,
    /// Number of leaves in the subtree.
    pub(crate) size: i64,
    /// Cached canonical hash; filled in when the node is persisted or
    /// decoded, cleared by `clone_for_update`.
    pub(crate) hash: Option<NodeHash>,
    pub(crate) persisted: bool,
    pub(crate) left: Option<ChildRef>,
    pub(crate) right: Option<ChildRef>,
}

impl Node {
    pub(crate) fn new_leaf(key: Vec<u8>, value: Vec<u8>, version: Version) -> Self {
        Self {
            key,
            value: Some(value),
            version,
            height: 0,
            size: 1,
            hash: None,
            persisted: false,
            left: None,
            right: None,
        }
    }

    pub(crate) fn new_inner(
        key: Vec<u8>,
        version: Version,
        height: i8,
        size: i64,
        left: ChildRef,
        right: ChildRef,
    ) -> Self {
        Self {
            key,
            value: None,
            version,
            height,
            size,
            hash: None,
            persisted: false,
            left: Some(left),
            right: Some(right),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.value.is_some()
    }

    /// Shallow, unpersisted copy stamped with `version`, with the cached
    /// hash cleared. The only legitimate way to mutate a persisted node.
    pub(crate) fn clone_for_update(&self, version: Version) -> Node {
        Node {
            key: self.key.clone(),
            value: self.value.clone(),
            version,
            height: self.height,
            size: self.size,
            hash: None,
            persisted: false,
            left: self.left.clone(),
            right: self.right.clone(),
        }
    }

    pub(crate) fn left_ref(&self) -> &ChildRef {
        match &self.left {
            Some(child) => child,
            None => panic!("inner node is missing its left child"),
        }
    }

    pub(crate) fn right_ref(&self) -> &ChildRef {
        match &self.right {
            Some(child) => child,
            None => panic!("inner node is missing its right child"),
        }
    }

    pub(crate) fn set_left(&mut self, child: ChildRef) {
        self.left = Some(child);
    }

    pub(crate) fn set_right(&mut self, child: ChildRef) {
        self.right = Some(child);
    }

    pub(crate) fn take_right(&mut self) -> ChildRef {
        match self.right.take() {
            Some(child) => child,
            None => panic!("inner node is missing its right child"),
        }
    }

    pub(crate) fn take_left(&mut self) -> ChildRef {
        match self.left.take() {
            Some(child) => child,
            None => panic!("inner node is missing its left child"),
        }
    }

    /// Recompute height and size from the (resolved) children.
    pub(crate) fn update_height_size(&mut self, ndb: &crate::node_db::NodeDb) -> Result<(), TreeError> {
        let left = ndb.resolve(self.left_ref())?;
        let right = ndb.resolve(self.right_ref())?;
        self.height = 1 + left.height.max(right.height);
        self.size = left.size + right.size;
        Ok(())
    }

    /// Height of the left subtree minus height of the right subtree.
    pub(crate) fn balance_factor(&self, ndb: &crate::node_db::NodeDb) -> Result<i32, TreeError> {
        let left = ndb.resolve(self.left_ref())?;
        let right = ndb.resolve(self.right_ref())?;
        Ok(left.height as i32 - right.height as i32)
    }

    /// Canonical hash of this subtree, computing unpersisted descendants on
    /// the fly. Persisted and freshly saved nodes answer from the cache.
    ///
    /// Preimage: `varint(height) ‖ varint(size) ‖ varint(version)` then
    /// `bytes(key) ‖ bytes(sha256(value))` for leaves or
    /// `bytes(leftHash) ‖ bytes(rightHash) ‖ bytes(key)` for inner nodes,
    /// with zigzag varints for the integers and unsigned varint length
    /// prefixes.
    pub(crate) fn subtree_hash(&self) -> NodeHash {
        if let Some(hash) = self.hash {
            return hash;
        }
        let mut pre = Vec::with_capacity(96 + self.key.len());
        encode::write_varint(&mut pre, self.height as i64);
        encode::write_varint(&mut pre, self.size);
        encode::write_varint(&mut pre, self.version);
        match &self.value {
            Some(value) => {
                let value_hash: [u8; 32] = Sha256::digest(value).into();
                encode::write_bytes(&mut pre, &self.key);
                encode::write_bytes(&mut pre, &value_hash);
            }
            None => {
                let left = child_hash(&self.left);
                let right = child_hash(&self.right);
                encode::write_bytes(&mut pre, &left.0);
                encode::write_bytes(&mut pre, &right.0);
                encode::write_bytes(&mut pre, &self.key);
            }
        }
        NodeHash(Sha256::digest(&pre).into())
    }
}

fn child_hash(child: &Option<ChildRef>) -> NodeHash {
    match child {
        Some(ChildRef::Hash(hash)) => *hash,
        Some(ChildRef::Node(node)) => node.subtree_hash(),
        None => panic!("inner node is missing a child"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable() {
        let leaf = Node::new_leaf(b"alpha".to_vec(), b"one".to_vec(), 3);
        assert_eq!(leaf.subtree_hash(), leaf.subtree_hash());
    }

    #[test]
    fn hash_covers_version() {
        let a = Node::new_leaf(b"alpha".to_vec(), b"one".to_vec(), 1);
        let b = Node::new_leaf(b"alpha".to_vec(), b"one".to_vec(), 2);
        assert_ne!(a.subtree_hash(), b.subtree_hash());
    }

    #[test]
    fn empty_value_hashes_differently_from_other_values() {
        let empty = Node::new_leaf(b"k".to_vec(), Vec::new(), 1);
        let zero = Node::new_leaf(b"k".to_vec(), vec![0], 1);
        assert_ne!(empty.subtree_hash(), zero.subtree_hash());
    }

    #[test]
    fn clone_for_update_clears_hash_and_persistence() {
        let mut leaf = Node::new_leaf(b"k".to_vec(), b"v".to_vec(), 1);
        leaf.hash = Some(leaf.subtree_hash());
        leaf.persisted = true;

        let copy = leaf.clone_for_update(5);
        assert!(copy.hash.is_none());
        assert!(!copy.persisted);
        assert_eq!(copy.version, 5);
        assert_eq!(copy.key, leaf.key);
    }

    #[test]
    fn inner_hash_depends_on_children() {
        let left = Arc::new(Node::new_leaf(b"a".to_vec(), b"1".to_vec(), 1));
        let right = Arc::new(Node::new_leaf(b"b".to_vec(), b"2".to_vec(), 1));
        let inner = Node::new_inner(
            b"b".to_vec(),
            1,
            1,
            2,
            ChildRef::Node(left.clone()),
            ChildRef::Node(right),
        );

        let other_right = Arc::new(Node::new_leaf(b"b".to_vec(), b"3".to_vec(), 1));
        let other = Node::new_inner(
            b"b".to_vec(),
            1,
            1,
            2,
            ChildRef::Node(left),
            ChildRef::Node(other_right),
        );
        assert_ne!(inner.subtree_hash(), other.subtree_hash());
    }
}
