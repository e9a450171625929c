//! Memory tier of a region

use lru::LruCache;
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use tracing::debug;

use crate::element::{CacheElement, CacheKey, Cacheable};

/// The memory store a region sits on.
///
/// The store only decides *which* element should go next; capacity is
/// enforced by the region, which asks for [`MemoryStore::eviction_candidate`]
/// and spools the element before removing it.
pub trait MemoryStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<CacheElement<K, V>>;

    /// Read without touching recency or idle bookkeeping
    fn get_quiet(&self, key: &K) -> Option<CacheElement<K, V>>;

    fn put(&self, element: CacheElement<K, V>);

    fn remove(&self, key: &K) -> bool;

    fn remove_all(&self);

    fn size(&self) -> usize;

    /// Key the eviction policy would drop first
    fn eviction_candidate(&self) -> Option<K>;

    fn keys(&self) -> Vec<K>;
}

struct MemoryEntry<K, V> {
    element: CacheElement<K, V>,
    last_access: Instant,
}

/// Least-recently-used memory store.
///
/// Elements with an idle time that have not been read within it are dropped
/// on the next `get`.
pub struct LruMemoryStore<K: CacheKey, V> {
    entries: Mutex<LruCache<K, MemoryEntry<K, V>>>,
}

impl<K: CacheKey, V: Cacheable> Default for LruMemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey, V: Cacheable> LruMemoryStore<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<K, MemoryEntry<K, V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: CacheKey, V: Cacheable> MemoryStore<K, V> for LruMemoryStore<K, V> {
    fn get(&self, key: &K) -> Option<CacheElement<K, V>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;

        let attributes = &entry.element.attributes;
        if !attributes.is_eternal
            && let Some(idle) = attributes.idle_time()
            && !idle.is_zero()
            && entry.last_access.elapsed() > idle
        {
            debug!("Memory element for key {} exceeded idle time, dropping", key);
            entries.pop(key);
            return None;
        }

        entry.last_access = Instant::now();
        Some(entry.element.clone())
    }

    fn get_quiet(&self, key: &K) -> Option<CacheElement<K, V>> {
        self.entries().peek(key).map(|entry| entry.element.clone())
    }

    fn put(&self, element: CacheElement<K, V>) {
        let key = element.key.clone();
        self.entries().put(
            key,
            MemoryEntry {
                element,
                last_access: Instant::now(),
            },
        );
    }

    fn remove(&self, key: &K) -> bool {
        self.entries().pop(key).is_some()
    }

    fn remove_all(&self) {
        self.entries().clear();
    }

    fn size(&self) -> usize {
        self.entries().len()
    }

    fn eviction_candidate(&self) -> Option<K> {
        self.entries().peek_lru().map(|(key, _)| key.clone())
    }

    fn keys(&self) -> Vec<K> {
        self.entries().iter().map(|(key, _)| key.clone()).collect()
    }
}
