use crossbeam_skiplist::SkipMap;
use log::debug;

use crate::data_store::versioned_value::VersionedValue;
use crate::CacheKey;

/// The authoritative in-memory copy of the cache, implemented using a lock-free SkipMap.
///
/// Transactions never write here directly: pending values live in the
/// transaction's write set until the finish phase applies them, while the
/// writing transaction still owns the keys' locks.
pub struct CacheStore {
    data: SkipMap<CacheKey, VersionedValue>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Creates a new, empty `CacheStore`.
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
        }
    }

    /// Retrieves a `VersionedValue` by key.
    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Inserts or replaces the value stored under `key`.
    pub fn insert(&self, key: CacheKey, value: VersionedValue) {
        self.data.insert(key, value);
    }

    /// Removes the value stored under `key`, returning it.
    pub fn delete(&self, key: &str) -> Option<VersionedValue> {
        self.data.remove(key).map(|entry| entry.value().clone())
    }

    /// Drops an entry from memory on behalf of the eviction policy.
    ///
    /// Returns `true` if an entry was present.
    pub fn evict(&self, key: &str) -> bool {
        let evicted = self.data.remove(key).is_some();
        if evicted {
            debug!("Evicted key '{}' from cache store", key);
        }
        evicted
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns all keys currently cached, in key order.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.data.iter().map(|entry| entry.key().clone()).collect()
    }
}
