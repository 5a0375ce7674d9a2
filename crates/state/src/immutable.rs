//! Read-only tree views bound to a single version.

use crate::iterator::TreeIterator;
use crate::node::Node;
use crate::node_db::NodeDb;
use canopy_types::{empty_root_hash, RootHash, TreeError, Version};
use std::sync::Arc;

/// A read-only view of the tree at one version.
///
/// Obtained from `MutableTree::get_immutable`, or implicitly as the working
/// and last-saved views inside the mutable tree. Safe to read concurrently
/// as long as the underlying version is not deleted.
#[derive(Clone)]
pub struct ImmutableTree {
    pub(crate) root: Option<Arc<Node>>,
    pub(crate) ndb: Arc<NodeDb>,
    pub(crate) version: Version,
}

impl ImmutableTree {
    pub(crate) fn empty(ndb: Arc<NodeDb>, version: Version) -> Self {
        Self {
            root: None,
            ndb,
            version,
        }
    }

    /// The version this view is bound to.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Number of keys in the tree.
    pub fn size(&self) -> i64 {
        self.root.as_ref().map_or(0, |root| root.size)
    }

    /// Height of the root node; 0 for a single leaf or an empty tree.
    pub fn height(&self) -> i8 {
        self.root.as_ref().map_or(0, |root| root.height)
    }

    /// Whether the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Root hash of this view; the hash of the empty input for an empty
    /// tree.
    pub fn root_hash(&self) -> RootHash {
        self.root
            .as_ref()
            .map_or_else(empty_root_hash, |root| root.subtree_hash().into())
    }

    /// Look up `key`.
    ///
    /// When the fast index covers this version the answer comes from it;
    /// otherwise (or when the entry postdates this version) the tree is
    /// descended.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if self.root.is_none() {
            return Ok(None);
        }
        if self.ndb.is_fast_cache_enabled()? {
            match self.ndb.get_fast_node(key)? {
                Some(fast) => {
                    if fast.version_last_updated_at <= self.version {
                        return Ok(Some(fast.value.clone()));
                    }
                }
                None => {
                    // The fast index mirrors live state: at the latest
                    // version a missing entry means a missing key.
                    if self.version == self.ndb.latest_version()? {
                        return Ok(None);
                    }
                }
            }
        }
        self.get_from_tree(key)
    }

    /// Look up `key` by descending the tree, ignoring the fast index.
    pub(crate) fn get_from_tree(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let mut node = root.clone();
        loop {
            if node.is_leaf() {
                return Ok(if node.key.as_slice() == key {
                    node.value.clone()
                } else {
                    None
                });
            }
            node = if key < node.key.as_slice() {
                self.ndb.resolve(node.left_ref())?
            } else {
                self.ndb.resolve(node.right_ref())?
            };
        }
    }

    /// In-order iteration over every key-value pair.
    pub fn iter(&self) -> TreeIterator<'_> {
        self.range(None, None, true)
    }

    /// In-order iteration over `[start, end)`, descending when `ascending`
    /// is false.
    pub fn range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> TreeIterator<'_> {
        TreeIterator::new(self, start, end, ascending)
    }
}
