//! Per-key async locks
//!
//! Serializes writers for one key (a plugin id, an artifact path) while leaving
//! other keys free to proceed concurrently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// A map of lazily created async mutexes
#[derive(Debug)]
pub struct KeyedLocks<K> {
    name: &'static str,
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the writer lock for `key`
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let start = Instant::now();
        let guard = mutex.lock_owned().await;
        debug!(
            lock = self.name,
            lock_key = ?key,
            elapsed_ms = start.elapsed().as_millis(),
            "Lock acquired"
        );
        guard
    }

    /// Number of keys currently tracked
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}
