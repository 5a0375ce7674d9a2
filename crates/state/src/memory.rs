//! Resident-memory watchdog used while the fast index is rebuilt.

use crate::node_db::NodeDb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Samples resident memory on a background thread; above the limit it asks
/// the node store to release its caches. The rebuild can touch every leaf
/// in the tree, and this keeps its footprint bounded.
///
/// The thread is stopped and joined on drop, so the watcher never outlives
/// the rebuild that spawned it.
pub(crate) struct MemoryWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryWatcher {
    pub(crate) fn spawn(ndb: Arc<NodeDb>, limit: u64, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                if let Some(usage) = memory_stats::memory_stats() {
                    if usage.physical_mem as u64 > limit {
                        log::debug!(
                            "resident memory {} above limit {limit}, releasing node store caches",
                            usage.physical_mem
                        );
                        ndb.release_caches();
                    }
                }
                // Sleep in short slices so the stop flag is honored promptly.
                let mut slept = Duration::ZERO;
                while slept < interval && !stop_flag.load(Ordering::Relaxed) {
                    let slice = Duration::from_millis(50).min(interval - slept);
                    std::thread::sleep(slice);
                    slept += slice;
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
