//! Per-key async mutexes.
//!
//! Used to serialize work for one key (a user's turns, a user's clone target)
//! while unrelated keys proceed in parallel. The map itself is only locked
//! long enough to find or create an entry; waiting happens on the per-key
//! mutex, which is fair, so waiters acquire it in the order they asked.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A map of independent async locks keyed by `K`.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

/// Held for as long as the key is locked.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Drop entries nobody holds or waits on so the map tracks live keys only.
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Wait for and take the lock for `key`.
    pub async fn lock(&self, key: &K) -> KeyGuard {
        let lock = self.entry(key);
        KeyGuard {
            _guard: lock.lock_owned().await,
        }
    }
}
