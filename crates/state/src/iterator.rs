//! Iterators: in-order node traversal and the fast-index merge overlay.

use crate::fast_node::FastNode;
use crate::immutable::ImmutableTree;
use crate::node::Node;
use crate::node_db::NodeDb;
use canopy_types::TreeError;
use std::collections::{BTreeMap, BTreeSet};
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::Arc;

/// Key-value pairs yielded by every iterator in this module.
pub type IterItem = Result<(Vec<u8>, Vec<u8>), TreeError>;

/// In-order traversal of an [`ImmutableTree`], bounded to `[start, end)`.
///
/// Subtrees that cannot intersect the bounds are pruned using the pivot
/// invariant: left-descendant keys are strictly below the pivot, right
/// descendants start at it.
pub struct TreeIterator<'a> {
    tree: &'a ImmutableTree,
    stack: Vec<Arc<Node>>,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    ascending: bool,
    failed: bool,
}

impl<'a> TreeIterator<'a> {
    pub(crate) fn new(
        tree: &'a ImmutableTree,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Self {
        let stack = tree.root.iter().cloned().collect();
        Self {
            tree,
            stack,
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            ascending,
            failed: false,
        }
    }

    fn in_range(&self, key: &[u8]) -> bool {
        if let Some(start) = &self.start {
            if key < start.as_slice() {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key >= end.as_slice() {
                return false;
            }
        }
        true
    }
}

impl Iterator for TreeIterator<'_> {
    type Item = IterItem;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while let Some(node) = self.stack.pop() {
            if node.is_leaf() {
                if self.in_range(&node.key) {
                    let value = node.value.clone().unwrap_or_default();
                    return Some(Ok((node.key.clone(), value)));
                }
                continue;
            }
            let descend_left = self
                .start
                .as_ref()
                .map_or(true, |start| start.as_slice() < node.key.as_slice());
            let descend_right = self
                .end
                .as_ref()
                .map_or(true, |end| end.as_slice() > node.key.as_slice());

            // Pushed in reverse emission order.
            let sides: [(bool, &crate::node::ChildRef); 2] = if self.ascending {
                [(descend_right, node.right_ref()), (descend_left, node.left_ref())]
            } else {
                [(descend_left, node.left_ref()), (descend_right, node.right_ref())]
            };
            for (wanted, child) in sides {
                if !wanted {
                    continue;
                }
                match self.tree.ndb.resolve(child) {
                    Ok(resolved) => self.stack.push(resolved),
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
            }
        }
        None
    }
}

/// Merge of the persisted fast index with the unsaved working deltas.
///
/// Unsaved additions shadow persisted entries with the same key; unsaved
/// removals suppress them entirely. Both cursors are pre-bounded to
/// `[start, end)` and walk in the same direction, so a plain two-way merge
/// suffices.
pub struct MergedIterator<'a> {
    persisted: Peekable<Box<dyn Iterator<Item = Result<FastNode, TreeError>> + 'a>>,
    additions: Peekable<Box<dyn Iterator<Item = (&'a Vec<u8>, &'a FastNode)> + 'a>>,
    removals: &'a BTreeSet<Vec<u8>>,
    ascending: bool,
    failed: bool,
}

impl<'a> MergedIterator<'a> {
    pub(crate) fn new(
        ndb: &'a NodeDb,
        additions: &'a BTreeMap<Vec<u8>, FastNode>,
        removals: &'a BTreeSet<Vec<u8>>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Self, TreeError> {
        let persisted: Box<dyn Iterator<Item = Result<FastNode, TreeError>> + 'a> =
            Box::new(ndb.fast_iter(start, end, !ascending)?);

        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        let range = additions.range::<[u8], _>((lower, upper));
        let additions: Box<dyn Iterator<Item = (&'a Vec<u8>, &'a FastNode)> + 'a> = if ascending {
            Box::new(range)
        } else {
            Box::new(range.rev())
        };

        Ok(Self {
            persisted: persisted.peekable(),
            additions: additions.peekable(),
            removals,
            ascending,
            failed: false,
        })
    }
}

impl Iterator for MergedIterator<'_> {
    type Item = IterItem;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let take_addition = match (self.persisted.peek(), self.additions.peek()) {
                (Some(Err(_)), _) => {
                    self.failed = true;
                    match self.persisted.next() {
                        Some(Err(err)) => return Some(Err(err)),
                        _ => unreachable!("peeked an error"),
                    }
                }
                (Some(Ok(fast)), Some((key, _))) => {
                    if self.ascending {
                        key.as_slice() <= fast.key.as_slice()
                    } else {
                        key.as_slice() >= fast.key.as_slice()
                    }
                }
                (None, Some(_)) => true,
                (Some(Ok(_)), None) => false,
                (None, None) => return None,
            };

            if take_addition {
                let Some((key, fast)) = self.additions.next() else {
                    unreachable!("peeked an addition");
                };
                // A persisted entry under the same key is shadowed.
                if matches!(self.persisted.peek(), Some(Ok(p)) if p.key == *key) {
                    self.persisted.next();
                }
                return Some(Ok((key.clone(), fast.value.clone())));
            }

            let Some(Ok(fast)) = self.persisted.next() else {
                unreachable!("peeked a persisted entry");
            };
            if self.removals.contains(&fast.key) {
                continue;
            }
            return Some(Ok((fast.key, fast.value)));
        }
    }
}
