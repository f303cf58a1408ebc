use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes: concurrent mutation of the same key is serialized,
/// different keys proceed independently.
///
/// Used for the per-job, per-pool (repository), and per-container ordering
/// guarantees. Entries are created lazily and never dropped; key cardinality
/// is bounded by live entities.
#[derive(Clone, Default)]
pub struct KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Non-blocking attempt; `None` when another task holds the key.
    pub fn try_lock(&self, key: K) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }
}
