//! The working tree: copy-on-write edits over the last saved version, plus
//! the whole version lifecycle.

use crate::fast_node::FastNode;
use crate::immutable::ImmutableTree;
use crate::iterator::{IterItem, MergedIterator};
use crate::memory::MemoryWatcher;
use crate::node::{ChildRef, Node};
use crate::node_db::{NodeDb, SavedRoot};
use ahash::AHashMap;
use canopy_storage::Database;
use canopy_types::{RootHash, TreeError, TreeOptions, Version};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A versioned tree that tracks its own history.
///
/// Not safe for concurrent use: callers must serialize all mutating calls.
/// Immutable views obtained from [`MutableTree::get_immutable`] may be read
/// in parallel as long as their version is not deleted.
///
/// Returned byte vectors are owned copies; mutating them never affects the
/// tree.
pub struct MutableTree {
    /// The current working tree; its `version` field stays at the last
    /// saved version until the next save.
    tree: ImmutableTree,
    /// The most recently saved (or loaded) view.
    last_saved: ImmutableTree,
    /// Persisted nodes shadowed by working-tree edits, keyed by hash, with
    /// the version each node was created at.
    orphans: AHashMap<canopy_types::NodeHash, Version>,
    /// Version presence registry, hydrated lazily under lazy loads.
    versions: Mutex<AHashMap<Version, bool>>,
    all_root_loaded: bool,
    /// Fast-index entries written since the last save.
    unsaved_additions: BTreeMap<Vec<u8>, FastNode>,
    /// Keys removed since the last save; disjoint from `unsaved_additions`.
    unsaved_removals: BTreeSet<Vec<u8>>,
    ndb: Arc<NodeDb>,
}

impl MutableTree {
    /// A tree over `db` with the given node-cache capacity and default
    /// options.
    pub fn new(db: Arc<dyn Database>, cache_size: usize) -> Result<Self, TreeError> {
        Self::new_with_opts(db, TreeOptions::with_cache_size(cache_size))
    }

    /// A tree over `db` with explicit options.
    pub fn new_with_opts(db: Arc<dyn Database>, opts: TreeOptions) -> Result<Self, TreeError> {
        let ndb = Arc::new(NodeDb::new(db, opts)?);
        let tree = ImmutableTree::empty(ndb.clone(), 0);
        Ok(Self {
            last_saved: tree.clone(),
            tree,
            orphans: AHashMap::new(),
            versions: Mutex::new(AHashMap::new()),
            all_root_loaded: false,
            unsaved_additions: BTreeMap::new(),
            unsaved_removals: BTreeSet::new(),
            ndb,
        })
    }

    /// The last saved version; 0 before any save.
    pub fn version(&self) -> Version {
        self.tree.version
    }

    fn working_version(&self) -> Version {
        self.tree.version + 1
    }

    /// Number of keys in the working tree.
    pub fn size(&self) -> i64 {
        self.tree.size()
    }

    /// Height of the working tree.
    pub fn height(&self) -> i8 {
        self.tree.height()
    }

    /// Whether the working tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Root hash of the last saved version; the hash of the empty input
    /// before any save.
    pub fn hash(&self) -> RootHash {
        self.last_saved.root_hash()
    }

    /// Root hash of the current working tree, unsaved edits included.
    pub fn working_hash(&self) -> RootHash {
        self.tree.root_hash()
    }

    /// Override the configured initial version. Only consulted by the first
    /// save of a tree with no saved versions.
    pub fn set_initial_version(&mut self, version: u64) {
        self.ndb.set_initial_version(version);
    }

    // ---- lookups ----

    /// Value for `key` in the working tree, unsaved edits included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if self.tree.root.is_none() {
            return Ok(None);
        }
        if let Some(fast) = self.unsaved_additions.get(key) {
            return Ok(Some(fast.value.clone()));
        }
        if self.unsaved_removals.contains(key) {
            return Ok(None);
        }
        self.tree.get(key)
    }

    /// Value for `key` at a specific saved version, or `None` when either
    /// the key or the version is absent.
    pub fn get_versioned(&self, key: &[u8], version: Version) -> Result<Option<Vec<u8>>, TreeError> {
        if !self.version_exists(version) {
            return Ok(None);
        }
        if self.ndb.is_fast_cache_enabled()? {
            match self.ndb.get_fast_node(key)? {
                Some(fast) => {
                    // The entry is rewritten on every update, so it answers
                    // for any version at or after its last update.
                    if fast.version_last_updated_at <= version {
                        return Ok(Some(fast.value.clone()));
                    }
                }
                None => {
                    if version == self.ndb.latest_version()? {
                        return Ok(None);
                    }
                }
            }
        }
        match self.get_immutable(version) {
            Ok(view) => view.get_from_tree(key),
            Err(_) => Ok(None),
        }
    }

    /// A read-only view of a saved version, safe for concurrent reads while
    /// that version is not deleted.
    pub fn get_immutable(&self, version: Version) -> Result<ImmutableTree, TreeError> {
        let root = self
            .ndb
            .get_root(version)?
            .ok_or(TreeError::VersionDoesNotExist)?;
        lock(&self.versions).insert(version, true);
        Ok(match root {
            SavedRoot::Empty => ImmutableTree::empty(self.ndb.clone(), version),
            SavedRoot::Node(hash) => ImmutableTree {
                root: Some(self.ndb.get_node(&hash)?),
                ndb: self.ndb.clone(),
                version,
            },
        })
    }

    // ---- iteration ----

    /// Iterate every key-value pair of the working tree in ascending key
    /// order, unsaved edits included.
    pub fn iter(&self) -> Result<Box<dyn Iterator<Item = IterItem> + '_>, TreeError> {
        self.range(None, None, true)
    }

    /// Iterate `[start, end)` of the working tree in the requested
    /// direction, unsaved edits included.
    pub fn range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Box<dyn Iterator<Item = IterItem> + '_>, TreeError> {
        if self.ndb.is_fast_cache_enabled()? {
            Ok(Box::new(MergedIterator::new(
                &self.ndb,
                &self.unsaved_additions,
                &self.unsaved_removals,
                start,
                end,
                ascending,
            )?))
        } else {
            Ok(Box::new(self.tree.range(start, end, ascending)))
        }
    }

    // ---- mutation ----

    /// Insert or update `key`. Returns `true` when an existing value was
    /// replaced, `false` for a new key.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, TreeError> {
        if key.is_empty() {
            return Err(TreeError::EmptyKey);
        }
        let mut orphaned = Vec::new();
        let updated = self.set_internal(key, value, &mut orphaned)?;
        self.add_orphans(orphaned);
        Ok(updated)
    }

    fn set_internal(
        &mut self,
        key: &[u8],
        value: &[u8],
        orphaned: &mut Vec<Arc<Node>>,
    ) -> Result<bool, TreeError> {
        let version = self.working_version();
        let Some(root) = self.tree.root.clone() else {
            self.add_unsaved_addition(key, FastNode::new(key.to_vec(), value.to_vec(), version));
            self.tree.root = Some(Arc::new(Node::new_leaf(
                key.to_vec(),
                value.to_vec(),
                version,
            )));
            return Ok(false);
        };
        let (new_root, updated) = self.recursive_set(root, key, value, orphaned)?;
        self.tree.root = Some(new_root);
        Ok(updated)
    }

    fn recursive_set(
        &mut self,
        node: Arc<Node>,
        key: &[u8],
        value: &[u8],
        orphaned: &mut Vec<Arc<Node>>,
    ) -> Result<(Arc<Node>, bool), TreeError> {
        let version = self.working_version();

        if node.is_leaf() {
            self.add_unsaved_addition(key, FastNode::new(key.to_vec(), value.to_vec(), version));
            return Ok(match key.cmp(node.key.as_slice()) {
                std::cmp::Ordering::Less => {
                    // The existing leaf becomes the right child; its key is
                    // the new pivot.
                    let leaf = Arc::new(Node::new_leaf(key.to_vec(), value.to_vec(), version));
                    let inner = Node::new_inner(
                        node.key.clone(),
                        version,
                        1,
                        2,
                        ChildRef::Node(leaf),
                        ChildRef::Node(node),
                    );
                    (Arc::new(inner), false)
                }
                std::cmp::Ordering::Greater => {
                    let leaf = Arc::new(Node::new_leaf(key.to_vec(), value.to_vec(), version));
                    let inner = Node::new_inner(
                        key.to_vec(),
                        version,
                        1,
                        2,
                        ChildRef::Node(node),
                        ChildRef::Node(leaf),
                    );
                    (Arc::new(inner), false)
                }
                std::cmp::Ordering::Equal => {
                    orphaned.push(node);
                    let leaf = Node::new_leaf(key.to_vec(), value.to_vec(), version);
                    (Arc::new(leaf), true)
                }
            });
        }

        orphaned.push(node.clone());
        let mut new_node = node.clone_for_update(version);
        if key < node.key.as_slice() {
            let left = self.ndb.resolve(node.left_ref())?;
            let (new_left, updated) = self.recursive_set(left, key, value, orphaned)?;
            new_node.set_left(ChildRef::Node(new_left));
            if updated {
                return Ok((Arc::new(new_node), true));
            }
        } else {
            let right = self.ndb.resolve(node.right_ref())?;
            let (new_right, updated) = self.recursive_set(right, key, value, orphaned)?;
            new_node.set_right(ChildRef::Node(new_right));
            if updated {
                return Ok((Arc::new(new_node), true));
            }
        }
        new_node.update_height_size(&self.ndb)?;
        let balanced = self.balance(new_node, orphaned)?;
        Ok((balanced, false))
    }

    /// Remove `key`, returning its value when it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if key.is_empty() {
            return Err(TreeError::EmptyKey);
        }
        let Some(root) = self.tree.root.clone() else {
            return Ok(None);
        };
        let mut orphaned = Vec::new();
        let (replacement, _, value) = self.recursive_remove(root, key, &mut orphaned)?;
        if orphaned.is_empty() {
            return Ok(None);
        }
        self.add_unsaved_removal(key);
        self.tree.root = match replacement {
            None => None,
            Some(ChildRef::Node(node)) => Some(node),
            Some(ChildRef::Hash(hash)) => Some(self.ndb.get_node(&hash)?),
        };
        self.add_orphans(orphaned);
        Ok(value)
    }

    /// Returns the replacement subtree (`None` when the removed leaf had no
    /// sibling at this level), the new leftmost key of the right subtree if
    /// it changed, and the removed value. "Nothing removed" is signaled by
    /// `orphaned` staying empty.
    #[allow(clippy::type_complexity)]
    fn recursive_remove(
        &mut self,
        node: Arc<Node>,
        key: &[u8],
        orphaned: &mut Vec<Arc<Node>>,
    ) -> Result<(Option<ChildRef>, Option<Vec<u8>>, Option<Vec<u8>>), TreeError> {
        let version = self.working_version();

        if node.is_leaf() {
            if key == node.key.as_slice() {
                let value = node.value.clone();
                orphaned.push(node);
                return Ok((None, None, value));
            }
            return Ok((Some(ChildRef::Node(node)), None, None));
        }

        if key < node.key.as_slice() {
            let left = self.ndb.resolve(node.left_ref())?;
            let (new_left, new_key, value) = self.recursive_remove(left, key, orphaned)?;
            if orphaned.is_empty() {
                return Ok((Some(ChildRef::Node(node)), None, value));
            }
            orphaned.push(node.clone());
            let Some(new_left) = new_left else {
                // The removed leaf was the whole left subtree: the right
                // child takes this node's place, and the pivot becomes the
                // new leftmost key for some ancestor to adopt.
                return Ok((Some(node.right_ref().clone()), Some(node.key.clone()), value));
            };
            let mut new_node = node.clone_for_update(version);
            new_node.set_left(new_left);
            new_node.update_height_size(&self.ndb)?;
            let balanced = self.balance(new_node, orphaned)?;
            return Ok((Some(ChildRef::Node(balanced)), new_key, value));
        }

        let right = self.ndb.resolve(node.right_ref())?;
        let (new_right, new_key, value) = self.recursive_remove(right, key, orphaned)?;
        if orphaned.is_empty() {
            return Ok((Some(ChildRef::Node(node)), None, value));
        }
        orphaned.push(node.clone());
        let Some(new_right) = new_right else {
            return Ok((Some(node.left_ref().clone()), None, value));
        };
        let mut new_node = node.clone_for_update(version);
        new_node.set_right(new_right);
        if let Some(new_key) = new_key {
            // The leftmost key of our right subtree changed; consume it.
            new_node.key = new_key;
        }
        new_node.update_height_size(&self.ndb)?;
        let balanced = self.balance(new_node, orphaned)?;
        Ok((Some(ChildRef::Node(balanced)), None, value))
    }

    // ---- rebalancing ----

    fn rotate_right(&mut self, node: Arc<Node>) -> Result<(Node, Arc<Node>), TreeError> {
        let version = self.working_version();
        let mut node = node.clone_for_update(version);
        let orphaned = self.ndb.resolve(node.left_ref())?;
        let mut new_node = orphaned.clone_for_update(version);

        let grandchild = new_node.take_right();
        node.set_left(grandchild);
        node.update_height_size(&self.ndb)?;
        new_node.set_right(ChildRef::Node(Arc::new(node)));
        new_node.update_height_size(&self.ndb)?;

        Ok((new_node, orphaned))
    }

    fn rotate_left(&mut self, node: Arc<Node>) -> Result<(Node, Arc<Node>), TreeError> {
        let version = self.working_version();
        let mut node = node.clone_for_update(version);
        let orphaned = self.ndb.resolve(node.right_ref())?;
        let mut new_node = orphaned.clone_for_update(version);

        let grandchild = new_node.take_left();
        node.set_right(grandchild);
        node.update_height_size(&self.ndb)?;
        new_node.set_left(ChildRef::Node(Arc::new(node)));
        new_node.update_height_size(&self.ndb)?;

        Ok((new_node, orphaned))
    }

    fn balance(
        &mut self,
        node: Node,
        orphaned: &mut Vec<Arc<Node>>,
    ) -> Result<Arc<Node>, TreeError> {
        if node.persisted {
            panic!("balance called on a persisted node");
        }
        let factor = node.balance_factor(&self.ndb)?;

        if factor > 1 {
            let left = self.ndb.resolve(node.left_ref())?;
            if left.balance_factor(&self.ndb)? >= 0 {
                // left-left
                let (new_node, orphan) = self.rotate_right(Arc::new(node))?;
                orphaned.push(orphan);
                return Ok(Arc::new(new_node));
            }
            // left-right
            let mut node = node;
            let (rotated_left, left_orphan) = self.rotate_left(left.clone())?;
            node.set_left(ChildRef::Node(Arc::new(rotated_left)));
            let (new_node, right_orphan) = self.rotate_right(Arc::new(node))?;
            orphaned.push(left);
            orphaned.push(left_orphan);
            orphaned.push(right_orphan);
            return Ok(Arc::new(new_node));
        }

        if factor < -1 {
            let right = self.ndb.resolve(node.right_ref())?;
            if right.balance_factor(&self.ndb)? <= 0 {
                // right-right
                let (new_node, orphan) = self.rotate_left(Arc::new(node))?;
                orphaned.push(orphan);
                return Ok(Arc::new(new_node));
            }
            // right-left
            let mut node = node;
            let (rotated_right, right_orphan) = self.rotate_right(right.clone())?;
            node.set_right(ChildRef::Node(Arc::new(rotated_right)));
            let (new_node, left_orphan) = self.rotate_left(Arc::new(node))?;
            orphaned.push(right);
            orphaned.push(right_orphan);
            orphaned.push(left_orphan);
            return Ok(Arc::new(new_node));
        }

        Ok(Arc::new(node))
    }

    // ---- orphan and fast-delta bookkeeping ----

    fn add_orphans(&mut self, orphaned: Vec<Arc<Node>>) {
        for node in orphaned {
            if !node.persisted {
                // Never visible to other versions, nothing to track.
                continue;
            }
            let Some(hash) = node.hash else {
                panic!("orphaned node has no hash");
            };
            self.orphans.insert(hash, node.version);
        }
    }

    fn add_unsaved_addition(&mut self, key: &[u8], node: FastNode) {
        self.unsaved_removals.remove(key);
        self.unsaved_additions.insert(key.to_vec(), node);
    }

    fn add_unsaved_removal(&mut self, key: &[u8]) {
        self.unsaved_additions.remove(key);
        self.unsaved_removals.insert(key.to_vec());
    }

    // ---- registry ----

    /// Whether `version` was saved and still exists. Under lazy loading the
    /// backend is consulted on a registry miss.
    pub fn version_exists(&self, version: Version) -> bool {
        {
            let versions = lock(&self.versions);
            if self.all_root_loaded {
                return versions.get(&version).copied().unwrap_or(false);
            }
            if let Some(&known) = versions.get(&version) {
                return known;
            }
        }
        // Registry miss; ask the backend without holding the lock across
        // the read.
        let has = self.ndb.has_root(version).unwrap_or_else(|err| {
            log::warn!("failed to check backend for version {version}: {err}");
            false
        });
        lock(&self.versions).insert(version, has);
        has
    }

    /// All known versions, ascending.
    ///
    /// After a lazy load the registry is hydrated on demand, so the list is
    /// only guaranteed complete after a non-lazy [`MutableTree::load_version`].
    pub fn available_versions(&self) -> Vec<Version> {
        let versions = lock(&self.versions);
        let mut known: Vec<Version> = versions
            .iter()
            .filter_map(|(&version, &present)| present.then_some(version))
            .collect();
        known.sort_unstable();
        known
    }

    // ---- version lifecycle ----

    /// Save the working tree as the next version. Returns its root hash and
    /// version number.
    ///
    /// With nothing to save (no edits since the last save or load) this is
    /// idempotent and returns the current `(hash, version)` unchanged.
    pub fn save_version(&mut self) -> Result<(RootHash, Version), TreeError> {
        if self.tree.version > 0
            && self.orphans.is_empty()
            && self.unsaved_additions.is_empty()
            && self.unsaved_removals.is_empty()
        {
            return Ok((self.hash(), self.tree.version));
        }

        let mut version = self.working_version();
        let initial_version = self.ndb.initial_version();
        if version == 1 && initial_version > 0 {
            version = initial_version as Version;
        }

        if self.version_exists(version) {
            // Saving over an existing version is legal only when the
            // contents are identical.
            let existing = match self.ndb.get_root(version)? {
                Some(SavedRoot::Node(hash)) => RootHash::from(hash),
                Some(SavedRoot::Empty) | None => canopy_types::empty_root_hash(),
            };
            let new = self.working_hash();
            if existing == new {
                self.tree.version = version;
                self.last_saved = self.tree.clone();
                self.orphans.clear();
                self.unsaved_additions.clear();
                self.unsaved_removals.clear();
                return Ok((existing, version));
            }
            return Err(TreeError::OverwriteMismatch {
                version,
                existing,
                new,
            });
        }

        match self.tree.root.as_mut() {
            None => {
                // There can still be orphans, e.g. when the last key was
                // removed this version.
                log::debug!("saving empty tree at version {version}");
                self.ndb.save_orphans(version, &self.orphans)?;
                self.ndb.save_empty_root(version)?;
            }
            Some(root) => {
                log::debug!("saving tree at version {version}");
                let root_hash = self.ndb.save_branch(root)?;
                self.ndb.save_orphans(version, &self.orphans)?;
                self.ndb.save_root(root_hash, version)?;
            }
        }
        self.save_fast_node_version()?;
        self.ndb.commit()?;

        lock(&self.versions).insert(version, true);
        self.tree.version = version;
        self.last_saved = self.tree.clone();
        self.orphans.clear();
        self.unsaved_additions.clear();
        self.unsaved_removals.clear();

        Ok((self.hash(), version))
    }

    fn save_fast_node_version(&mut self) -> Result<(), TreeError> {
        for node in self.unsaved_additions.values() {
            self.ndb.save_fast_node(node)?;
        }
        for key in &self.unsaved_removals {
            self.ndb.delete_fast_node(key)?;
        }
        self.ndb.set_fast_storage_version_to_batch()
    }

    /// Discard every unsaved edit, reinstating the last saved version as the
    /// working tree.
    pub fn rollback(&mut self) {
        self.tree = if self.tree.version > 0 {
            self.last_saved.clone()
        } else {
            ImmutableTree::empty(self.ndb.clone(), 0)
        };
        self.orphans.clear();
        self.unsaved_additions.clear();
        self.unsaved_removals.clear();
    }

    /// Load the latest saved version.
    pub fn load(&mut self) -> Result<Version, TreeError> {
        self.load_version(0)
    }

    /// Load `target`, or the latest version when `target` is 0. Hydrates the
    /// whole version registry.
    pub fn load_version(&mut self, target: Version) -> Result<Version, TreeError> {
        let roots = self.ndb.get_roots()?;

        if roots.is_empty() {
            if target <= 0 {
                self.enable_fast_storage_and_commit_if_not_enabled()?;
                return Ok(0);
            }
            return Err(TreeError::VersionMismatch { target, latest: 0 });
        }

        let mut first_version = 0;
        let mut latest = 0;
        let mut latest_root = None;
        {
            let mut versions = lock(&self.versions);
            for (&version, root) in &roots {
                versions.insert(version, true);
                if version > latest && (target == 0 || version <= target) {
                    latest = version;
                    latest_root = *root;
                }
                if first_version == 0 || version < first_version {
                    first_version = version;
                }
            }
        }

        if target > 0 && latest != target {
            return Err(TreeError::VersionMismatch { target, latest });
        }
        let initial_version = self.ndb.initial_version();
        if first_version > 0 && first_version < initial_version as Version {
            return Err(TreeError::InitialVersionViolation {
                found: first_version,
                configured: initial_version,
            });
        }

        let mut tree = ImmutableTree::empty(self.ndb.clone(), latest);
        if let Some(hash) = latest_root {
            tree.root = Some(self.ndb.get_node(&hash)?);
        }

        self.orphans.clear();
        self.unsaved_additions.clear();
        self.unsaved_removals.clear();
        self.tree = tree;
        self.last_saved = self.tree.clone();
        self.all_root_loaded = true;

        self.enable_fast_storage_and_commit_if_not_enabled()?;
        Ok(latest)
    }

    /// Load a single version without enumerating all roots. Intended for
    /// read-mostly use; writing after a lazy load is only well-defined
    /// against `target` itself.
    pub fn lazy_load_version(&mut self, target: Version) -> Result<Version, TreeError> {
        let latest = self.ndb.latest_version()?;
        if latest < target {
            return Err(TreeError::VersionMismatch { target, latest });
        }
        if latest <= 0 {
            if target <= 0 {
                self.enable_fast_storage_and_commit_if_not_enabled()?;
                return Ok(0);
            }
            return Err(TreeError::VersionMismatch { target, latest: 0 });
        }
        let target = if target <= 0 { latest } else { target };

        let root = self
            .ndb
            .get_root(target)?
            .ok_or(TreeError::VersionDoesNotExist)?;
        lock(&self.versions).insert(target, true);

        let mut tree = ImmutableTree::empty(self.ndb.clone(), target);
        if let SavedRoot::Node(hash) = root {
            tree.root = Some(self.ndb.get_node(&hash)?);
        }

        self.orphans.clear();
        self.unsaved_additions.clear();
        self.unsaved_removals.clear();
        self.tree = tree;
        self.last_saved = self.tree.clone();

        self.enable_fast_storage_and_commit_if_not_enabled()?;
        Ok(target)
    }

    /// Load `target` and delete every version above it, so the next save
    /// rewrites history from there.
    pub fn load_version_for_overwriting(&mut self, target: Version) -> Result<Version, TreeError> {
        let latest = self.load_version(target)?;
        // The deletion walk still needs the old latest-version cursor; reset
        // it before the fast-index rebuild so the storage-version marker is
        // stamped with the version history now ends at.
        self.ndb.delete_versions_from(target + 1)?;
        self.ndb.reset_latest_version(latest);
        self.enable_fast_storage_and_commit()?;

        let mut versions = lock(&self.versions);
        versions.retain(|&version, _| version <= target);

        Ok(latest)
    }

    /// Delete a single saved version. The latest saved version cannot be
    /// deleted.
    pub fn delete_version(&mut self, version: Version) -> Result<(), TreeError> {
        log::debug!("deleting version {version}");
        if version <= 0 {
            return Err(TreeError::NonPositiveVersion);
        }
        if version == self.version() {
            return Err(TreeError::CannotDeleteLatest(version));
        }
        if !self.version_exists(version) {
            return Err(TreeError::VersionDoesNotExist);
        }
        self.ndb.delete_version(version, true)?;
        self.ndb.commit()?;
        lock(&self.versions).remove(&version);
        Ok(())
    }

    /// Delete the half-open range `[from, to)` of versions in one atomic
    /// batch.
    pub fn delete_versions_range(&mut self, from: Version, to: Version) -> Result<(), TreeError> {
        self.ndb.delete_versions_range(from, to)?;
        self.ndb.commit()?;
        let mut versions = lock(&self.versions);
        for version in from..to {
            versions.remove(&version);
        }
        Ok(())
    }

    /// Delete an arbitrary set of versions, grouped into contiguous runs.
    #[deprecated(note = "group deletions explicitly with delete_versions_range instead")]
    pub fn delete_versions(&mut self, versions: &[Version]) -> Result<(), TreeError> {
        log::debug!("deleting versions {versions:?}");
        if versions.is_empty() {
            return Ok(());
        }
        let mut sorted = versions.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut run_start = sorted[0];
        let mut prev = sorted[0];
        for &version in &sorted[1..] {
            if version == prev + 1 {
                prev = version;
                continue;
            }
            self.delete_versions_range(run_start, prev + 1)?;
            run_start = version;
            prev = version;
        }
        self.delete_versions_range(run_start, prev + 1)
    }

    // ---- fast-index upgrade ----

    /// Whether the next load would rebuild the fast index, either because it
    /// was never enabled or because the store demands a forced refresh.
    pub fn is_upgradeable(&self) -> Result<bool, TreeError> {
        Ok(!self.ndb.has_upgraded_to_fast_storage()
            || self.ndb.should_force_fast_storage_upgrade()?)
    }

    fn enable_fast_storage_and_commit_if_not_enabled(&mut self) -> Result<bool, TreeError> {
        let should_force = self.ndb.should_force_fast_storage_upgrade()?;
        let enabled = self.ndb.has_upgraded_to_fast_storage();
        if !self.is_upgradeable()? {
            return Ok(false);
        }

        if enabled && should_force {
            // A past downgrade may have left entries we cannot trust; drop
            // them all before repopulating.
            let stale: Vec<Vec<u8>> = self
                .ndb
                .fast_iter(None, None, false)?
                .map(|entry| entry.map(|fast| fast.key))
                .collect::<Result<_, _>>()?;
            for key in stale {
                self.ndb.delete_fast_node(&key)?;
            }
        }

        if let Err(err) = self.enable_fast_storage_and_commit() {
            log::warn!("fast index rebuild failed, will retry on next load: {err}");
            self.ndb.reset_storage_version_in_memory();
            return Err(err);
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn working_root(&self) -> Option<&Arc<Node>> {
        self.tree.root.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn node_db(&self) -> &NodeDb {
        &self.ndb
    }

    #[cfg(test)]
    pub(crate) fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    fn enable_fast_storage_and_commit(&mut self) -> Result<(), TreeError> {
        log::info!("rebuilding the fast index, this may take a while");
        let watcher = MemoryWatcher::spawn(
            self.ndb.clone(),
            self.ndb.options().upgrade_memory_limit,
            self.ndb.options().upgrade_sample_interval,
        );

        let result = (|| {
            let version = self.tree.version;
            for item in self.tree.range(None, None, true) {
                let (key, value) = item?;
                self.ndb
                    .save_fast_node_no_cache(&FastNode::new(key, value, version))?;
            }
            self.ndb.set_fast_storage_version_to_batch()?;
            self.ndb.commit()
        })();

        // Stops and joins the sampler before returning.
        drop(watcher);
        result
    }
}
