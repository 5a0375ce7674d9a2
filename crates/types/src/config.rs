//! Shared configuration for the versioned tree and its node store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default capacity of the node store's LRU cache.
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

/// Default resident-memory ceiling honored while the fast index is rebuilt.
pub const DEFAULT_UPGRADE_MEMORY_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Default sampling interval of the rebuild memory watchdog.
pub const DEFAULT_UPGRADE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables for a versioned tree instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Capacity of the node LRU cache held by the node store.
    pub cache_size: usize,
    /// Version assigned to the first saved snapshot; 0 means "start at 1".
    /// Only consulted while no version has been saved yet.
    pub initial_version: u64,
    /// Resident-memory ceiling, in bytes, while rebuilding the fast index.
    /// Crossing it makes the node store release its caches.
    pub upgrade_memory_limit: u64,
    /// How often the rebuild watchdog samples resident memory.
    pub upgrade_sample_interval: Duration,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            initial_version: 0,
            upgrade_memory_limit: DEFAULT_UPGRADE_MEMORY_LIMIT,
            upgrade_sample_interval: DEFAULT_UPGRADE_SAMPLE_INTERVAL,
        }
    }
}

impl TreeOptions {
    /// Options with a specific node-cache capacity and everything else at
    /// its default.
    pub fn with_cache_size(cache_size: usize) -> Self {
        Self {
            cache_size,
            ..Self::default()
        }
    }
}
