//! Region cache: a memory tier in front of ordered auxiliary tiers
//!
//! This module composes one region's tiers into a single cache:
//! - Memory store (synchronous, always consulted first)
//! - Auxiliary tiers (disk, lateral, remote), each fed by its own event queue
//!
//! The region supports:
//! - Read-through to auxiliaries in configured order, promoting hits to memory
//! - Asynchronous propagation of put/remove/removeAll/dispose to every tier
//! - Spooling of elements evicted from memory to disk tiers
//! - A terminal, idempotent dispose

use regex::Regex;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tracing::{debug, info, warn};

use crate::{
    CacheError,
    config::{CompositeCacheAttributes, DiskUsagePattern, EventQueueConfig},
    element::{CacheElement, CacheKey, Cacheable, ElementAttributes},
    event_queue::CacheEventQueue,
    listener::{AuxiliaryCache, AuxiliaryKind, CacheListener, CacheStatus, next_listener_id},
    memory::{LruMemoryStore, MemoryStore},
};

/// One auxiliary tier of a region together with the queue that feeds it
pub struct AuxiliaryTier<K: CacheKey, V: Cacheable> {
    cache: Arc<dyn AuxiliaryCache<K, V>>,
    queue: CacheEventQueue<K, V>,
}

impl<K: CacheKey, V: Cacheable> AuxiliaryTier<K, V> {
    pub fn cache(&self) -> &Arc<dyn AuxiliaryCache<K, V>> {
        &self.cache
    }

    pub fn queue(&self) -> &CacheEventQueue<K, V> {
        &self.queue
    }

    pub fn kind(&self) -> AuxiliaryKind {
        self.cache.kind()
    }

    /// Run an enqueue against this tier's queue. A rejected event only
    /// degrades this tier, so it is logged and swallowed.
    fn send(&self, what: &str, enqueue: impl FnOnce(&CacheEventQueue<K, V>) -> Result<(), CacheError>) {
        if let Err(e) = enqueue(&self.queue) {
            debug!(
                "Dropping {} for {:?} tier of region {}: {}",
                what,
                self.cache.kind(),
                self.queue.cache_name(),
                e
            );
        }
    }
}

/// Hit and miss counters for a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionStats {
    pub memory_hits: u64,
    pub auxiliary_hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub size: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    auxiliary_hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

struct RegionInner<K: CacheKey, V: Cacheable> {
    attributes: CompositeCacheAttributes,
    element_attributes: ElementAttributes,
    memory: Box<dyn MemoryStore<K, V>>,
    auxiliaries: Vec<AuxiliaryTier<K, V>>,
    disposed: AtomicBool,
    /// Held while memory changes and the events for that change are queued,
    /// so every tier sees mutations in the order memory applied them
    mutation: Mutex<()>,
    counters: Counters,
}

/// A named cache region
pub struct RegionCache<K: CacheKey, V: Cacheable> {
    inner: Arc<RegionInner<K, V>>,
}

impl<K: CacheKey, V: Cacheable> Clone for RegionCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for a [`RegionCache`]
///
/// # Example
///
/// ```ignore
/// let region = RegionCache::builder(CompositeCacheAttributes::new("users"))
///     .auxiliary(Arc::new(disk_cache), EventQueueConfig::default())
///     .build()?;
/// ```
pub struct RegionCacheBuilder<K: CacheKey, V: Cacheable> {
    attributes: CompositeCacheAttributes,
    element_attributes: ElementAttributes,
    memory: Option<Box<dyn MemoryStore<K, V>>>,
    auxiliaries: Vec<(Arc<dyn AuxiliaryCache<K, V>>, EventQueueConfig)>,
}

impl<K: CacheKey, V: Cacheable> RegionCacheBuilder<K, V> {
    /// Default attributes for elements created with [`RegionCache::put_value`]
    pub fn element_attributes(mut self, attributes: ElementAttributes) -> Self {
        self.element_attributes = attributes;
        self
    }

    /// Replace the default LRU memory store
    pub fn memory_store(mut self, memory: Box<dyn MemoryStore<K, V>>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Append an auxiliary tier; tiers are consulted in the order added.
    pub fn auxiliary(
        mut self,
        cache: Arc<dyn AuxiliaryCache<K, V>>,
        queue_config: EventQueueConfig,
    ) -> Self {
        self.auxiliaries.push((cache, queue_config));
        self
    }

    /// Build the region, creating one event queue per auxiliary.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<RegionCache<K, V>, CacheError> {
        let name = self.attributes.cache_name.clone();
        let mut auxiliaries = Vec::with_capacity(self.auxiliaries.len());
        for (cache, queue_config) in self.auxiliaries {
            let mut listener_id = cache.listener_id();
            if listener_id == 0 {
                listener_id = next_listener_id();
                cache.set_listener_id(listener_id);
            }
            let listener: Arc<dyn CacheListener<K, V>> = cache.clone();
            let queue = CacheEventQueue::new(listener, listener_id, name.clone(), &queue_config)?;
            debug!(
                "Region {} tier {} is {:?} (listener {})",
                name,
                auxiliaries.len(),
                cache.kind(),
                listener_id
            );
            auxiliaries.push(AuxiliaryTier { cache, queue });
        }

        info!(
            "Region {} created with {} auxiliaries, max objects {}",
            name,
            auxiliaries.len(),
            self.attributes.max_objects
        );

        Ok(RegionCache {
            inner: Arc::new(RegionInner {
                attributes: self.attributes,
                element_attributes: self.element_attributes,
                memory: self
                    .memory
                    .unwrap_or_else(|| Box::new(LruMemoryStore::new())),
                auxiliaries,
                disposed: AtomicBool::new(false),
                mutation: Mutex::new(()),
                counters: Counters::default(),
            }),
        })
    }
}

impl<K: CacheKey, V: Cacheable> RegionCache<K, V> {
    pub fn builder(attributes: CompositeCacheAttributes) -> RegionCacheBuilder<K, V> {
        RegionCacheBuilder {
            attributes,
            element_attributes: ElementAttributes::default(),
            memory: None,
            auxiliaries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.attributes.cache_name
    }

    pub fn attributes(&self) -> &CompositeCacheAttributes {
        &self.inner.attributes
    }

    pub fn element_attributes(&self) -> &ElementAttributes {
        &self.inner.element_attributes
    }

    pub fn status(&self) -> CacheStatus {
        if self.inner.disposed.load(Ordering::SeqCst) {
            CacheStatus::Disposed
        } else {
            CacheStatus::Alive
        }
    }

    /// Number of elements in the memory tier
    pub fn size(&self) -> usize {
        self.inner.memory.size()
    }

    pub fn auxiliaries(&self) -> &[AuxiliaryTier<K, V>] {
        &self.inner.auxiliaries
    }

    pub fn auxiliary_count(&self) -> usize {
        self.inner.auxiliaries.len()
    }

    /// Whether every auxiliary queue has delivered everything handed to it
    pub fn is_propagation_idle(&self) -> bool {
        self.inner.auxiliaries.iter().all(|tier| tier.queue.is_empty())
    }

    pub fn stats(&self) -> RegionStats {
        let counters = &self.inner.counters;
        RegionStats {
            memory_hits: counters.memory_hits.load(Ordering::Relaxed),
            auxiliary_hits: counters.auxiliary_hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
            size: self.inner.memory.size(),
        }
    }

    fn ensure_alive(&self) -> Result<(), CacheError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(CacheError::Disposed(self.name().to_owned()));
        }
        Ok(())
    }

    /// Get an element: memory first, then each auxiliary in order.
    ///
    /// An auxiliary hit is copied into memory before it is returned.
    pub async fn get(&self, key: &K) -> Result<Option<CacheElement<K, V>>, CacheError> {
        self.ensure_alive()?;
        let counters = &self.inner.counters;

        if let Some(element) = self.inner.memory.get(key) {
            if !element.is_expired() {
                debug!("Memory hit in region {} for key {}", self.name(), key);
                counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(element));
            }
            debug!("Memory element for key {} in region {} expired", key, self.name());
            counters.expired.fetch_add(1, Ordering::Relaxed);
            self.remove(key)?;
            counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        for tier in &self.inner.auxiliaries {
            if tier.cache.status() != CacheStatus::Alive {
                continue;
            }
            let element = match tier.cache.get(key).await {
                Ok(Some(element)) => element,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "{:?} tier of region {} failed to get key {} ({}). Trying next tier.",
                        tier.cache.kind(),
                        self.name(),
                        key,
                        e
                    );
                    continue;
                }
            };

            if element.is_expired() {
                debug!(
                    "{:?} tier of region {} returned expired element for key {}",
                    tier.cache.kind(),
                    self.name(),
                    key
                );
                counters.expired.fetch_add(1, Ordering::Relaxed);
                self.remove(key)?;
                continue;
            }

            debug!(
                "{:?} tier hit in region {} for key {}",
                tier.cache.kind(),
                self.name(),
                key
            );
            counters.auxiliary_hits.fetch_add(1, Ordering::Relaxed);
            {
                let _guard = self.inner.lock_mutations();
                if !self.inner.disposed.load(Ordering::SeqCst) {
                    self.inner.memory.put(element.clone());
                    self.inner.evict_over_capacity();
                }
            }
            return Ok(Some(element));
        }

        debug!("Miss in region {} for key {}", self.name(), key);
        counters.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Elements whose key display form matches `pattern`.
    ///
    /// Memory wins over auxiliaries, earlier auxiliaries over later ones.
    /// Matches are not promoted into memory.
    pub async fn get_matching(
        &self,
        pattern: &str,
    ) -> Result<HashMap<K, CacheElement<K, V>>, CacheError> {
        self.ensure_alive()?;
        let pattern = Regex::new(pattern)?;

        let mut matches = HashMap::new();
        for key in self.inner.memory.keys() {
            if !pattern.is_match(&key.to_string()) {
                continue;
            }
            if let Some(element) = self.inner.memory.get_quiet(&key)
                && !element.is_expired()
            {
                matches.insert(key, element);
            }
        }

        for tier in &self.inner.auxiliaries {
            if tier.cache.status() != CacheStatus::Alive {
                continue;
            }
            match tier.cache.get_matching(&pattern).await {
                Ok(found) => {
                    for (key, element) in found {
                        if !element.is_expired() {
                            matches.entry(key).or_insert(element);
                        }
                    }
                }
                Err(e) => warn!(
                    "{:?} tier of region {} failed to match {} ({})",
                    tier.cache.kind(),
                    self.name(),
                    pattern,
                    e
                ),
            }
        }
        Ok(matches)
    }

    /// Put an element into memory and queue it for every eligible tier.
    pub fn put(&self, element: CacheElement<K, V>) -> Result<(), CacheError> {
        let _guard = self.inner.lock_mutations();
        self.ensure_alive()?;
        debug!("Put in region {} for key {}", self.name(), element.key);

        self.inner.memory.put(element.clone());
        self.inner.evict_over_capacity();

        for tier in &self.inner.auxiliaries {
            if self.inner.should_propagate_put(tier, &element) {
                tier.send("put", |queue| queue.enqueue_put(element.clone()));
            }
        }
        Ok(())
    }

    /// Put a value using the region's default element attributes.
    pub fn put_value(&self, key: K, value: V) -> Result<(), CacheError> {
        let element = CacheElement::new(
            self.name().to_owned(),
            key,
            value,
            &self.inner.element_attributes,
        );
        self.put(element)
    }

    /// Remove from memory and queue the removal for every tier.
    ///
    /// Returns whether memory held the key.
    pub fn remove(&self, key: &K) -> Result<bool, CacheError> {
        let _guard = self.inner.lock_mutations();
        self.ensure_alive()?;
        let removed = self.inner.memory.remove(key);
        debug!(
            "Remove in region {} for key {} (in memory: {})",
            self.name(),
            key,
            removed
        );
        for tier in &self.inner.auxiliaries {
            tier.send("remove", |queue| queue.enqueue_remove(key.clone()));
        }
        Ok(removed)
    }

    /// Clear memory and ask every tier to clear itself.
    ///
    /// Tiers that disallow removeAll keep their data.
    pub fn remove_all(&self) -> Result<(), CacheError> {
        let _guard = self.inner.lock_mutations();
        self.ensure_alive()?;
        info!("RemoveAll in region {}", self.name());
        self.inner.memory.remove_all();
        for tier in &self.inner.auxiliaries {
            tier.send("removeAll", |queue| queue.enqueue_remove_all());
        }
        Ok(())
    }

    /// Dispose the region. Only the first call has any effect.
    ///
    /// Spool-eligible memory elements are handed to disk tiers first, then
    /// every tier receives a dispose event and the memory tier is cleared.
    pub fn dispose(&self) {
        let _guard = self.inner.lock_mutations();
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            debug!("Region {} already disposed", self.name());
            return;
        }
        info!("Disposing region {}", self.name());

        if self.inner.attributes.spool_on_evict {
            let mut spooled = 0usize;
            for key in self.inner.memory.keys() {
                if let Some(element) = self.inner.memory.get_quiet(&key)
                    && self.inner.spool(element)
                {
                    spooled += 1;
                }
            }
            debug!("Region {} spooled {} elements on dispose", self.name(), spooled);
        }

        for tier in &self.inner.auxiliaries {
            tier.send("dispose", |queue| queue.enqueue_dispose());
        }
        self.inner.memory.remove_all();
    }
}

impl<K: CacheKey, V: Cacheable> RegionInner<K, V> {
    fn lock_mutations(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_propagate_put(&self, tier: &AuxiliaryTier<K, V>, element: &CacheElement<K, V>) -> bool {
        let attributes = &element.attributes;
        match tier.cache.kind() {
            AuxiliaryKind::Disk => {
                self.attributes.disk_usage_pattern == DiskUsagePattern::Update && attributes.is_spool
            }
            AuxiliaryKind::Lateral => attributes.is_lateral,
            AuxiliaryKind::Remote => attributes.is_remote,
        }
    }

    /// Hand an element to every disk tier. Returns whether any tier took it.
    fn spool(&self, element: CacheElement<K, V>) -> bool {
        if !(self.attributes.spool_on_evict && element.attributes.is_spool) {
            return false;
        }
        let mut spooled = false;
        for tier in self.auxiliaries.iter().filter(|t| t.cache.kind() == AuxiliaryKind::Disk) {
            match tier.queue.enqueue_put(element.clone()) {
                Ok(()) => spooled = true,
                Err(e) => debug!(
                    "Disk tier of region {} rejected spooled key {}: {}",
                    self.attributes.cache_name, element.key, e
                ),
            }
        }
        spooled
    }

    /// Evict until memory is back within `max_objects`, spooling as we go.
    /// Callers hold the mutation lock.
    fn evict_over_capacity(&self) {
        let max_objects = self.attributes.max_objects;
        while self.memory.size() > max_objects {
            let Some(key) = self.memory.eviction_candidate() else {
                break;
            };
            if let Some(element) = self.memory.get_quiet(&key) {
                if self.spool(element) {
                    debug!("Spooled evicted key {} of region {}", key, self.attributes.cache_name);
                } else {
                    debug!(
                        "Evicted key {} of region {} without spooling",
                        key, self.attributes.cache_name
                    );
                }
            }
            self.memory.remove(&key);
        }
    }
}
