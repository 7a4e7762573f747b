//! A mapping from string key to a mutual-exclusion primitive with the
//! property that `registry.lock(key)` always serializes on the same live
//! mutex as long as at least one caller holds a reference, but the entry is
//! discarded once unreferenced.
//!
//! Grounded on `rattler_repodata_gateway::utils::coalesced_map`'s
//! `Weak`-pointer eviction idiom, adapted from `Weak<broadcast::Sender<_>>`
//! (used there to coalesce concurrent fetches) to `Weak<tokio::sync::Mutex<()>>`
//! (used here to serialize concurrent writers).

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Every `SWEEP_INTERVAL` calls to [`LockRegistry::lock`], dead entries
/// (mutexes with no remaining holder) are swept from the map. This keeps
/// the map's memory bounded without paying a full scan on every call.
const SWEEP_INTERVAL: usize = 256;

/// The single global key used to serialize writes to `statistics.json`.
pub const STATISTICS_KEY: &str = "statistics.json";

/// A registry of weakly-held, lazily-created async mutexes keyed by string.
#[derive(Default)]
pub struct LockRegistry {
    entries: DashMap<String, Weak<Mutex<()>>>,
    calls: AtomicUsize,
}

/// A held lock on a registry entry. Dropping this releases the mutex and,
/// once no other holder remains, allows the registry to reclaim the entry.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries currently tracked, including any that
    /// have gone stale and not yet been swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the (possibly newly created) mutex for `key` without locking
    /// it. Exposed for callers that want to compose their own locking
    /// (e.g. `try_lock`); most callers should use [`LockRegistry::lock`].
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        if self.calls.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == 0 {
            self.sweep();
        }

        if let Some(existing) = self.entries.get(key) {
            if let Some(mutex) = existing.upgrade() {
                return mutex;
            }
        }

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if let Some(mutex) = entry.get().upgrade() {
                    mutex
                } else {
                    let mutex = Arc::new(Mutex::new(()));
                    entry.insert(Arc::downgrade(&mutex));
                    mutex
                }
            }
            Entry::Vacant(entry) => {
                let mutex = Arc::new(Mutex::new(()));
                entry.insert(Arc::downgrade(&mutex));
                mutex
            }
        }
    }

    /// Acquires the mutex for `key`, creating it on first access. The
    /// returned guard keeps the entry alive; once every guard for `key` is
    /// dropped the entry becomes eligible for eviction.
    pub async fn lock(&self, key: &str) -> LockGuard {
        let mutex = self.get(key);
        let guard = mutex.lock_owned().await;
        LockGuard { _guard: guard }
    }

    /// Drops any entries whose mutex has no remaining holder.
    fn sweep(&self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
    }
}
