//! Content-addressed node store layered over an ordered byte database.
//!
//! Everything lives in one keyspace under single-byte prefixes:
//!
//! - `n ‖ hash` — canonical node bytes
//! - `o ‖ be64(toVersion) ‖ be64(fromVersion) ‖ hash` — orphan index
//! - `r ‖ be64(version)` — root hash per version (empty value = empty root)
//! - `f ‖ key` — fast-index entries
//! - `m ‖ name` — metadata
//!
//! Writes accumulate in a pending batch; [`NodeDb::commit`] flushes it
//! atomically. That commit is the only point where a version becomes
//! visible to readers.

use crate::encode;
use crate::fast_node::FastNode;
use crate::node::{ChildRef, Node};
use canopy_storage::{Database, WriteBatch};
use canopy_types::{NodeHash, TreeError, TreeOptions, Version, HASH_SIZE};
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const NODE_PREFIX: u8 = b'n';
const ORPHAN_PREFIX: u8 = b'o';
const ROOT_PREFIX: u8 = b'r';
const FAST_PREFIX: u8 = b'f';
const META_PREFIX: u8 = b'm';

const STORAGE_VERSION_NAME: &[u8] = b"storage_version";
const DEFAULT_STORAGE_VERSION: &str = "1.0.0";
const FAST_STORAGE_VERSION: &str = "1.1.0";
const FAST_STORAGE_DELIMITER: char = '-';

/// Capacity of the fast-index entry cache.
const FAST_NODE_CACHE_SIZE: usize = 100_000;

fn node_key(hash: &NodeHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + HASH_SIZE);
    key.push(NODE_PREFIX);
    key.extend_from_slice(&hash.0);
    key
}

fn orphan_key(to_version: Version, from_version: Version, hash: &NodeHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 16 + HASH_SIZE);
    key.push(ORPHAN_PREFIX);
    key.extend_from_slice(&(to_version as u64).to_be_bytes());
    key.extend_from_slice(&(from_version as u64).to_be_bytes());
    key.extend_from_slice(&hash.0);
    key
}

fn parse_orphan_key(key: &[u8]) -> Result<(Version, Version, NodeHash), TreeError> {
    if key.len() != 1 + 16 + HASH_SIZE || key[0] != ORPHAN_PREFIX {
        return Err(canopy_types::StorageError::Decode(format!(
            "malformed orphan key ({} bytes)",
            key.len()
        ))
        .into());
    }
    let to = u64::from_be_bytes(key[1..9].try_into().expect("checked length")) as Version;
    let from = u64::from_be_bytes(key[9..17].try_into().expect("checked length")) as Version;
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&key[17..]);
    Ok((to, from, NodeHash(hash)))
}

fn root_key(version: Version) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(ROOT_PREFIX);
    key.extend_from_slice(&(version as u64).to_be_bytes());
    key
}

fn fast_key(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + user_key.len());
    key.push(FAST_PREFIX);
    key.extend_from_slice(user_key);
    key
}

fn meta_key(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(META_PREFIX);
    key.extend_from_slice(name);
    key
}

/// What `r ‖ version` resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SavedRoot {
    /// The version was saved with an empty tree.
    Empty,
    /// Root node hash of the version.
    Node(NodeHash),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct NodeDb {
    db: Arc<dyn Database>,
    batch: Mutex<WriteBatch>,
    node_cache: Mutex<LruCache<NodeHash, Arc<Node>>>,
    fast_cache: Mutex<LruCache<Vec<u8>, Arc<FastNode>>>,
    /// Lazily computed greatest saved version; `None` until first read.
    latest_version: Mutex<Option<Version>>,
    storage_version: Mutex<String>,
    initial_version: AtomicU64,
    opts: TreeOptions,
}

impl NodeDb {
    pub(crate) fn new(db: Arc<dyn Database>, opts: TreeOptions) -> Result<Self, TreeError> {
        let storage_version = match db.get(&meta_key(STORAGE_VERSION_NAME))? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => DEFAULT_STORAGE_VERSION.to_string(),
        };
        let node_cache_cap =
            NonZeroUsize::new(opts.cache_size.max(1)).expect("capacity is at least 1");
        let fast_cache_cap =
            NonZeroUsize::new(FAST_NODE_CACHE_SIZE).expect("constant is non-zero");
        Ok(Self {
            db,
            batch: Mutex::new(WriteBatch::new()),
            node_cache: Mutex::new(LruCache::new(node_cache_cap)),
            fast_cache: Mutex::new(LruCache::new(fast_cache_cap)),
            latest_version: Mutex::new(None),
            storage_version: Mutex::new(storage_version),
            initial_version: AtomicU64::new(opts.initial_version),
            opts,
        })
    }

    pub(crate) fn options(&self) -> &TreeOptions {
        &self.opts
    }

    pub(crate) fn initial_version(&self) -> u64 {
        self.initial_version.load(Ordering::Relaxed)
    }

    pub(crate) fn set_initial_version(&self, version: u64) {
        self.initial_version.store(version, Ordering::Relaxed);
    }

    // ---- nodes ----

    /// Fetch a node by hash, going through the LRU cache.
    pub(crate) fn get_node(&self, hash: &NodeHash) -> Result<Arc<Node>, TreeError> {
        if let Some(node) = lock(&self.node_cache).get(hash) {
            return Ok(node.clone());
        }
        let bytes = self.db.get(&node_key(hash))?.ok_or_else(|| {
            canopy_types::StorageError::Backend(format!("missing node {:?}", hash))
        })?;
        let node = Arc::new(encode::decode_node(*hash, &bytes)?);
        lock(&self.node_cache).put(*hash, node.clone());
        Ok(node)
    }

    /// Materialize a child reference.
    pub(crate) fn resolve(&self, child: &ChildRef) -> Result<Arc<Node>, TreeError> {
        match child {
            ChildRef::Hash(hash) => self.get_node(hash),
            ChildRef::Node(node) => Ok(node.clone()),
        }
    }

    fn save_node(&self, node: &Arc<Node>) -> Result<NodeHash, TreeError> {
        let hash = match node.hash {
            Some(hash) => hash,
            None => panic!("attempt to save a node without a hash"),
        };
        let bytes = encode::encode_node(node)?;
        lock(&self.batch).set(node_key(&hash), bytes);
        lock(&self.node_cache).put(hash, node.clone());
        Ok(hash)
    }

    /// Persist every unpersisted node reachable from `node`, post-order.
    /// In-memory children are detached into hash references as they land in
    /// the batch, so saved subtrees are re-read through the cache.
    pub(crate) fn save_branch(&self, node: &mut Arc<Node>) -> Result<NodeHash, TreeError> {
        if node.persisted {
            return match node.hash {
                Some(hash) => Ok(hash),
                None => panic!("persisted node without a hash"),
            };
        }
        {
            let n = Arc::make_mut(node);
            if matches!(n.left, Some(ChildRef::Node(_))) {
                let Some(ChildRef::Node(mut child)) = n.left.take() else {
                    unreachable!("checked variant above");
                };
                let hash = self.save_branch(&mut child)?;
                n.left = Some(ChildRef::Hash(hash));
            }
            if matches!(n.right, Some(ChildRef::Node(_))) {
                let Some(ChildRef::Node(mut child)) = n.right.take() else {
                    unreachable!("checked variant above");
                };
                let hash = self.save_branch(&mut child)?;
                n.right = Some(ChildRef::Hash(hash));
            }
            n.hash = Some(n.subtree_hash());
            n.persisted = true;
        }
        self.save_node(node)
    }

    fn uncache_node(&self, hash: &NodeHash) {
        lock(&self.node_cache).pop(hash);
    }

    // ---- roots ----

    pub(crate) fn get_root(&self, version: Version) -> Result<Option<SavedRoot>, TreeError> {
        match self.db.get(&root_key(version))? {
            None => Ok(None),
            Some(bytes) if bytes.is_empty() => Ok(Some(SavedRoot::Empty)),
            Some(bytes) => {
                let arr: [u8; HASH_SIZE] = bytes.as_slice().try_into().map_err(|_| {
                    canopy_types::StorageError::Decode(format!(
                        "root entry for version {version} is not a hash"
                    ))
                })?;
                Ok(Some(SavedRoot::Node(NodeHash(arr))))
            }
        }
    }

    pub(crate) fn has_root(&self, version: Version) -> Result<bool, TreeError> {
        Ok(self.db.has(&root_key(version))?)
    }

    /// All saved roots, keyed by version. `None` marks empty-tree versions.
    pub(crate) fn get_roots(&self) -> Result<BTreeMap<Version, Option<NodeHash>>, TreeError> {
        let mut roots = BTreeMap::new();
        let start = [ROOT_PREFIX];
        let end = [ROOT_PREFIX + 1];
        for entry in self.db.iter_range(&start, Some(&end), false)? {
            let (key, value) = entry?;
            let version = parse_root_version(&key)?;
            let hash = if value.is_empty() {
                None
            } else {
                let arr: [u8; HASH_SIZE] = value.as_slice().try_into().map_err(|_| {
                    canopy_types::StorageError::Decode(format!(
                        "root entry for version {version} is not a hash"
                    ))
                })?;
                Some(NodeHash(arr))
            };
            roots.insert(version, hash);
        }
        Ok(roots)
    }

    pub(crate) fn save_root(&self, hash: NodeHash, version: Version) -> Result<(), TreeError> {
        log::debug!("saving root {:?} for version {version}", hash);
        lock(&self.batch).set(root_key(version), hash.0.to_vec());
        self.update_latest_version(version);
        Ok(())
    }

    pub(crate) fn save_empty_root(&self, version: Version) -> Result<(), TreeError> {
        log::debug!("saving empty root for version {version}");
        lock(&self.batch).set(root_key(version), Vec::new());
        self.update_latest_version(version);
        Ok(())
    }

    pub(crate) fn latest_version(&self) -> Result<Version, TreeError> {
        if let Some(latest) = *lock(&self.latest_version) {
            return Ok(latest);
        }
        let start = [ROOT_PREFIX];
        let end = [ROOT_PREFIX + 1];
        let mut latest = 0;
        if let Some(entry) = self.db.iter_range(&start, Some(&end), true)?.next() {
            let (key, _) = entry?;
            latest = parse_root_version(&key)?;
        }
        *lock(&self.latest_version) = Some(latest);
        Ok(latest)
    }

    fn update_latest_version(&self, version: Version) {
        let mut cursor = lock(&self.latest_version);
        match *cursor {
            Some(latest) if latest >= version => {}
            _ => *cursor = Some(version),
        }
    }

    /// Force the latest-version cursor, after versions above it were dropped.
    pub(crate) fn reset_latest_version(&self, version: Version) {
        *lock(&self.latest_version) = Some(version);
    }

    /// Greatest saved version strictly below `version`, or 0.
    pub(crate) fn get_previous_version(&self, version: Version) -> Result<Version, TreeError> {
        let start = [ROOT_PREFIX];
        let end = root_key(version);
        if let Some(entry) = self.db.iter_range(&start, Some(&end), true)?.next() {
            let (key, _) = entry?;
            return parse_root_version(&key);
        }
        Ok(0)
    }

    // ---- orphans ----

    /// Record the working tree's orphans for a version being saved. Each
    /// orphan lived from its creation version through `version - 1`.
    pub(crate) fn save_orphans(
        &self,
        version: Version,
        orphans: &ahash::AHashMap<NodeHash, Version>,
    ) -> Result<(), TreeError> {
        let to_version = version - 1;
        for (hash, &from_version) in orphans {
            log::debug!(
                "orphaning node {} for versions [{from_version}, {to_version}]",
                hex::encode(hash.0)
            );
            self.save_orphan(*hash, from_version, to_version);
        }
        Ok(())
    }

    fn save_orphan(&self, hash: NodeHash, from_version: Version, to_version: Version) {
        lock(&self.batch).set(orphan_key(to_version, from_version, &hash), hash.0.to_vec());
    }

    /// Orphan entries whose lifetime ended right before `version`:
    /// `(store key, fromVersion, node hash)` triples.
    fn orphans_ending_at(
        &self,
        version: Version,
    ) -> Result<Vec<(Vec<u8>, Version, NodeHash)>, TreeError> {
        let start = orphan_key(version, 0, &NodeHash([0; HASH_SIZE]));
        let end = orphan_key(version + 1, 0, &NodeHash([0; HASH_SIZE]));
        let mut entries = Vec::new();
        for entry in self.db.iter_range(&start, Some(&end), false)? {
            let (key, _) = entry?;
            let (_, from, hash) = parse_orphan_key(&key)?;
            entries.push((key, from, hash));
        }
        Ok(entries)
    }

    fn all_orphans(&self) -> Result<Vec<(Vec<u8>, Version, Version, NodeHash)>, TreeError> {
        let start = [ORPHAN_PREFIX];
        let end = [ORPHAN_PREFIX + 1];
        let mut entries = Vec::new();
        for entry in self.db.iter_range(&start, Some(&end), false)? {
            let (key, _) = entry?;
            let (to, from, hash) = parse_orphan_key(&key)?;
            entries.push((key, to, from, hash));
        }
        Ok(entries)
    }

    // ---- version deletion ----

    /// Delete one version. Orphans that ended at `version - 1` are either
    /// re-keyed to the preceding surviving version or, when no surviving
    /// version references them, deleted together with their nodes.
    pub(crate) fn delete_version(
        &self,
        version: Version,
        check_latest: bool,
    ) -> Result<(), TreeError> {
        if check_latest && version == self.latest_version()? {
            return Err(TreeError::CannotDeleteLatest(version));
        }
        let predecessor = self.get_previous_version(version)?;
        self.delete_orphans_at(version, predecessor)?;
        lock(&self.batch).delete(root_key(version));
        Ok(())
    }

    /// Delete the half-open range `[from, to)` in one batch.
    pub(crate) fn delete_versions_range(
        &self,
        from_version: Version,
        to_version: Version,
    ) -> Result<(), TreeError> {
        if from_version >= to_version {
            return Err(TreeError::InvalidRange {
                from: from_version,
                to: to_version,
            });
        }
        if from_version <= 0 {
            return Err(TreeError::NonPositiveVersion);
        }
        let latest = self.latest_version()?;
        if latest < to_version {
            return Err(TreeError::CannotDeleteLatest(latest));
        }
        let predecessor = self.get_previous_version(from_version)?;
        for version in from_version..to_version {
            self.delete_orphans_at(version, predecessor)?;
            lock(&self.batch).delete(root_key(version));
        }
        Ok(())
    }

    fn delete_orphans_at(&self, version: Version, predecessor: Version) -> Result<(), TreeError> {
        for (key, from_version, hash) in self.orphans_ending_at(version)? {
            lock(&self.batch).delete(key);
            if predecessor < from_version {
                // No surviving version can reference the node.
                lock(&self.batch).delete(node_key(&hash));
                self.uncache_node(&hash);
            } else {
                self.save_orphan(hash, from_version, predecessor);
            }
        }
        Ok(())
    }

    /// Drop every version `>= version`: roots, nodes created at or after it
    /// (found by walking the latest root), orphan entries that pointed past
    /// it, and fast entries last updated at or after it.
    pub(crate) fn delete_versions_from(&self, version: Version) -> Result<(), TreeError> {
        let latest = self.latest_version()?;
        if latest < version {
            return Ok(());
        }
        if let Some(SavedRoot::Node(root)) = self.get_root(latest)? {
            self.delete_nodes_from(version, &root)?;
        }
        for (key, to, from, hash) in self.all_orphans()? {
            if from >= version {
                lock(&self.batch).delete(key);
                lock(&self.batch).delete(node_key(&hash));
                self.uncache_node(&hash);
            } else if to >= version - 1 {
                // The node outlives the rollback target again.
                lock(&self.batch).delete(key);
            }
        }
        for v in version..=latest {
            lock(&self.batch).delete(root_key(v));
        }
        for entry in self.fast_iter(None, None, false)? {
            let fast = entry?;
            if fast.version_last_updated_at >= version {
                self.delete_fast_node(&fast.key)?;
            }
        }
        Ok(())
    }

    fn delete_nodes_from(&self, version: Version, hash: &NodeHash) -> Result<(), TreeError> {
        let node = self.get_node(hash)?;
        if let Some(ChildRef::Hash(left)) = &node.left {
            self.delete_nodes_from(version, left)?;
        }
        if let Some(ChildRef::Hash(right)) = &node.right {
            self.delete_nodes_from(version, right)?;
        }
        if node.version >= version {
            lock(&self.batch).delete(node_key(hash));
            self.uncache_node(hash);
        }
        Ok(())
    }

    // ---- fast index ----

    pub(crate) fn get_fast_node(&self, key: &[u8]) -> Result<Option<Arc<FastNode>>, TreeError> {
        if let Some(node) = lock(&self.fast_cache).get(key) {
            return Ok(Some(node.clone()));
        }
        let Some(bytes) = self.db.get(&fast_key(key))? else {
            return Ok(None);
        };
        let node = Arc::new(encode::decode_fast_node(key.to_vec(), &bytes)?);
        lock(&self.fast_cache).put(key.to_vec(), node.clone());
        Ok(Some(node))
    }

    pub(crate) fn save_fast_node(&self, node: &FastNode) -> Result<(), TreeError> {
        lock(&self.batch).set(fast_key(&node.key), encode::encode_fast_node(node));
        lock(&self.fast_cache).put(node.key.clone(), Arc::new(node.clone()));
        Ok(())
    }

    /// Batch a fast entry without touching the cache; used by the bulk
    /// rebuild so it does not evict the working set.
    pub(crate) fn save_fast_node_no_cache(&self, node: &FastNode) -> Result<(), TreeError> {
        lock(&self.batch).set(fast_key(&node.key), encode::encode_fast_node(node));
        Ok(())
    }

    pub(crate) fn delete_fast_node(&self, key: &[u8]) -> Result<(), TreeError> {
        lock(&self.batch).delete(fast_key(key));
        lock(&self.fast_cache).pop(key);
        Ok(())
    }

    /// Persisted fast entries in `[start, end)` key order.
    pub(crate) fn fast_iter<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<impl Iterator<Item = Result<FastNode, TreeError>> + 'a, TreeError> {
        let start_key = match start {
            Some(s) => fast_key(s),
            None => vec![FAST_PREFIX],
        };
        let end_key = match end {
            Some(e) => fast_key(e),
            None => vec![FAST_PREFIX + 1],
        };
        let iter = self.db.iter_range(&start_key, Some(&end_key), reverse)?;
        Ok(iter.map(|entry| {
            let (key, value) = entry?;
            let user_key = key[1..].to_vec();
            Ok(encode::decode_fast_node(user_key, &value)?)
        }))
    }

    // ---- storage version ----

    pub(crate) fn storage_version(&self) -> String {
        lock(&self.storage_version).clone()
    }

    pub(crate) fn has_upgraded_to_fast_storage(&self) -> bool {
        self.storage_version().as_str() >= FAST_STORAGE_VERSION
    }

    /// True when the fast index was written against a different latest
    /// version than the store now has, e.g. after an external rollback.
    pub(crate) fn should_force_fast_storage_upgrade(&self) -> Result<bool, TreeError> {
        let storage_version = self.storage_version();
        let mut parts = storage_version.splitn(2, FAST_STORAGE_DELIMITER);
        let _base = parts.next();
        if let Some(written_at) = parts.next() {
            if written_at != self.latest_version()?.to_string() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub(crate) fn is_fast_cache_enabled(&self) -> Result<bool, TreeError> {
        Ok(self.has_upgraded_to_fast_storage() && !self.should_force_fast_storage_upgrade()?)
    }

    /// Stamp the fast-index marker with the current latest version.
    pub(crate) fn set_fast_storage_version_to_batch(&self) -> Result<(), TreeError> {
        let value = format!(
            "{FAST_STORAGE_VERSION}{FAST_STORAGE_DELIMITER}{}",
            self.latest_version()?
        );
        lock(&self.batch).set(meta_key(STORAGE_VERSION_NAME), value.clone().into_bytes());
        *lock(&self.storage_version) = value;
        Ok(())
    }

    /// Roll the in-memory marker back to "not upgraded" after a failed
    /// rebuild, so the next load retries it.
    pub(crate) fn reset_storage_version_in_memory(&self) {
        *lock(&self.storage_version) = DEFAULT_STORAGE_VERSION.to_string();
    }

    // ---- batch ----

    /// Flush the pending batch atomically.
    pub(crate) fn commit(&self) -> Result<(), TreeError> {
        let batch = std::mem::take(&mut *lock(&self.batch));
        log::debug!("committing batch of {} ops", batch.len());
        self.db.write(batch)?;
        Ok(())
    }

    /// Drop cached nodes and fast entries. Used as the reclamation callback
    /// when the rebuild watchdog sees resident memory above its limit.
    pub(crate) fn release_caches(&self) {
        lock(&self.node_cache).clear();
        lock(&self.fast_cache).clear();
    }
}

fn parse_root_version(key: &[u8]) -> Result<Version, TreeError> {
    if key.len() != 9 || key[0] != ROOT_PREFIX {
        return Err(canopy_types::StorageError::Decode(format!(
            "malformed root key ({} bytes)",
            key.len()
        ))
        .into());
    }
    Ok(u64::from_be_bytes(key[1..9].try_into().expect("checked length")) as Version)
}
