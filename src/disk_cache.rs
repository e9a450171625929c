//! Disk tier adapter
//!
//! [`DiskCache`] turns a raw [`DiskBackend`] into an auxiliary tier:
//! - writes go through the adapter's own event queue, so backend I/O never
//!   runs on the thread that handed the element over
//! - elements waiting to be written sit in a purgatory that reads consult
//!   first, so an update is visible before it reaches the backend
//! - removeAll is gated by the `allow_remove_all` attribute
//! - dispose drains pending writes (bounded by the shutdown spool limit) and
//!   is terminal

use async_trait::async_trait;
use regex::Regex;
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    CacheError,
    config::AuxiliaryCacheAttributes,
    element::{CacheElement, CacheKey, Cacheable},
    event_queue::{CacheEventQueue, EventQueueStats},
    listener::{AuxiliaryCache, AuxiliaryKind, CacheListener, CacheStatus, next_listener_id},
};

/// Storage hooks a concrete disk backend supplies.
///
/// The adapter serializes writes, so `process_update` is never called
/// concurrently with itself or with `process_remove`/`process_remove_all`.
#[async_trait]
pub trait DiskBackend<K: CacheKey, V: Cacheable>: Send + Sync + 'static {
    async fn process_get(&self, key: &K) -> io::Result<Option<CacheElement<K, V>>>;

    async fn process_get_matching(
        &self,
        pattern: &Regex,
    ) -> io::Result<HashMap<K, CacheElement<K, V>>>;

    async fn process_update(&self, element: CacheElement<K, V>) -> io::Result<()>;

    /// Returns whether the key was present
    async fn process_remove(&self, key: &K) -> io::Result<bool>;

    async fn process_remove_all(&self) -> io::Result<()>;

    async fn process_dispose(&self) -> io::Result<()>;
}

/// Counters exposed by [`DiskCache::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCacheStats {
    pub purgatory_size: usize,
    pub purgatory_hits: u64,
    /// Queued writes skipped because the element was removed first
    pub skipped_writes: u64,
    pub refused_remove_alls: u64,
    pub queue: EventQueueStats,
}

type Purgatory<K, V> = Mutex<HashMap<K, CacheElement<K, V>>>;

#[derive(Default)]
struct Counters {
    purgatory_hits: AtomicU64,
    skipped_writes: AtomicU64,
    refused_remove_alls: AtomicU64,
}

/// State shared between the adapter and its write queue's listener
struct DiskStore<K, V, B> {
    backend: B,
    purgatory: Purgatory<K, V>,
    /// Held while a write or a removal touches the backend
    write_lock: tokio::sync::Mutex<()>,
    counters: Counters,
    listener_id: AtomicU64,
}

impl<K: CacheKey, V: Cacheable, B: DiskBackend<K, V>> DiskStore<K, V, B> {
    fn purgatory(&self) -> MutexGuard<'_, HashMap<K, CacheElement<K, V>>> {
        self.purgatory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the newest purgatory entry for `key`, if it is still there.
    async fn spool(&self, key: &K) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;

        let Some(pending) = self.purgatory().get(key).cloned() else {
            debug!("Element for key {} left purgatory before it was written, skipping", key);
            self.counters.skipped_writes.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        self.backend.process_update(pending.clone()).await?;

        // A newer update for the key stays queued for its own event
        let mut purgatory = self.purgatory();
        if let Some(current) = purgatory.get(key)
            && Arc::ptr_eq(&current.value, &pending.value)
        {
            purgatory.remove(key);
        }
        Ok(())
    }
}

/// Listener for the adapter's internal write queue
struct PurgatoryWriter<K, V, B> {
    store: Arc<DiskStore<K, V, B>>,
}

#[async_trait]
impl<K: CacheKey, V: Cacheable, B: DiskBackend<K, V>> CacheListener<K, V>
    for PurgatoryWriter<K, V, B>
{
    async fn handle_put(&self, element: CacheElement<K, V>) -> io::Result<()> {
        self.store.spool(&element.key).await
    }

    async fn handle_remove(&self, _cache_name: &str, _key: &K) -> io::Result<()> {
        Ok(())
    }

    async fn handle_remove_all(&self, _cache_name: &str) -> io::Result<()> {
        Ok(())
    }

    async fn handle_dispose(&self, _cache_name: &str) -> io::Result<()> {
        Ok(())
    }

    fn listener_id(&self) -> u64 {
        self.store.listener_id.load(Ordering::Relaxed)
    }

    fn set_listener_id(&self, id: u64) {
        self.store.listener_id.store(id, Ordering::Relaxed);
    }
}

/// Auxiliary tier backed by a [`DiskBackend`]
pub struct DiskCache<K: CacheKey, V: Cacheable, B> {
    attributes: AuxiliaryCacheAttributes,
    store: Arc<DiskStore<K, V, B>>,
    queue: CacheEventQueue<K, V>,
    alive: AtomicBool,
    disposed: AtomicBool,
    listener_id: AtomicU64,
}

impl<K: CacheKey, V: Cacheable, B: DiskBackend<K, V>> DiskCache<K, V, B> {
    /// Wrap `backend`; must be called inside a tokio runtime.
    pub fn new(attributes: AuxiliaryCacheAttributes, backend: B) -> Result<Self, CacheError> {
        let writer_id = next_listener_id();
        let store = Arc::new(DiskStore {
            backend,
            purgatory: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
            listener_id: AtomicU64::new(writer_id),
        });
        let writer: Arc<dyn CacheListener<K, V>> = Arc::new(PurgatoryWriter {
            store: Arc::clone(&store),
        });
        let queue = CacheEventQueue::new(
            writer,
            writer_id,
            attributes.cache_name.clone(),
            &attributes.event_queue,
        )?;

        info!(
            "Disk cache {} for region {} ready (allow remove all: {})",
            attributes.name, attributes.cache_name, attributes.allow_remove_all
        );

        Ok(Self {
            attributes,
            store,
            queue,
            alive: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            listener_id: AtomicU64::new(0),
        })
    }

    pub fn attributes(&self) -> &AuxiliaryCacheAttributes {
        &self.attributes
    }

    pub fn backend(&self) -> &B {
        &self.store.backend
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Park the element in purgatory and queue it for writing.
    pub fn update(&self, element: CacheElement<K, V>) -> io::Result<()> {
        if !self.is_alive() {
            debug!(
                "Disk cache {} is not alive, ignoring update for key {}",
                self.attributes.name, element.key
            );
            return Ok(());
        }

        let key = element.key.clone();
        self.store.purgatory().insert(key.clone(), element.clone());
        if let Err(e) = self.queue.enqueue_put(element) {
            self.store.purgatory().remove(&key);
            error!(
                "Disk cache {} could not queue write for key {}: {}",
                self.attributes.name, key, e
            );
            return Err(io::Error::other(e));
        }
        Ok(())
    }

    /// Purgatory first, then the backend.
    pub async fn get(&self, key: &K) -> io::Result<Option<CacheElement<K, V>>> {
        if !self.is_alive() {
            return Ok(None);
        }
        if let Some(element) = self.store.purgatory().get(key).cloned() {
            debug!("Disk cache {} purgatory hit for key {}", self.attributes.name, key);
            self.store
                .counters
                .purgatory_hits
                .fetch_add(1, Ordering::Relaxed);
            return Ok(Some(element));
        }
        self.store.backend.process_get(key).await
    }

    pub async fn get_matching(&self, pattern: &Regex) -> io::Result<HashMap<K, CacheElement<K, V>>> {
        if !self.is_alive() {
            return Ok(HashMap::new());
        }
        let mut matches = self.store.backend.process_get_matching(pattern).await?;
        let purgatory = self.store.purgatory();
        for (key, element) in purgatory.iter() {
            if pattern.is_match(&key.to_string()) {
                matches.insert(key.clone(), element.clone());
            }
        }
        Ok(matches)
    }

    pub async fn remove(&self, key: &K) -> io::Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }
        let _guard = self.store.write_lock.lock().await;
        let in_purgatory = self.store.purgatory().remove(key).is_some();
        let on_disk = self.store.backend.process_remove(key).await?;
        Ok(in_purgatory || on_disk)
    }

    /// Clear the tier, unless removeAll is disallowed.
    ///
    /// Returns `Ok(false)` when the attribute refuses the operation; nothing is
    /// removed in that case.
    pub async fn remove_all(&self) -> io::Result<bool> {
        if !self.attributes.allow_remove_all {
            warn!(
                "RemoveAll was requested for disk cache {} (region {}) but AllowRemoveAll is set to false, ignoring",
                self.attributes.name, self.attributes.cache_name
            );
            self.store
                .counters
                .refused_remove_alls
                .fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        if !self.is_alive() {
            return Ok(false);
        }

        let _guard = self.store.write_lock.lock().await;
        self.store.purgatory().clear();
        self.store.backend.process_remove_all().await?;
        Ok(true)
    }

    /// Flush queued writes, then shut the backend down. Later calls do nothing.
    pub async fn dispose(&self) -> io::Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Disk cache {} already disposed", self.attributes.name);
            return Ok(());
        }

        let limit = self.attributes.shutdown_spool_time_limit();
        let deadline = tokio::time::Instant::now() + limit;
        while !self.queue.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.queue.is_empty() {
            warn!(
                "Disk cache {} still had {} queued writes after {:?}, dropping them",
                self.attributes.name,
                self.queue.stats().pending,
                limit
            );
        }
        self.queue.destroy();

        // A write still running past the limit finishes before the backend closes
        let result = {
            let _guard = self.store.write_lock.lock().await;
            self.store.backend.process_dispose().await
        };
        self.alive.store(false, Ordering::SeqCst);
        info!(
            "Disk cache {} for region {} disposed",
            self.attributes.name, self.attributes.cache_name
        );
        result
    }

    pub fn status(&self) -> CacheStatus {
        if self.is_alive() {
            CacheStatus::Alive
        } else {
            CacheStatus::Disposed
        }
    }

    pub fn stats(&self) -> DiskCacheStats {
        let counters = &self.store.counters;
        DiskCacheStats {
            purgatory_size: self.store.purgatory().len(),
            purgatory_hits: counters.purgatory_hits.load(Ordering::Relaxed),
            skipped_writes: counters.skipped_writes.load(Ordering::Relaxed),
            refused_remove_alls: counters.refused_remove_alls.load(Ordering::Relaxed),
            queue: self.queue.stats(),
        }
    }
}

#[async_trait]
impl<K: CacheKey, V: Cacheable, B: DiskBackend<K, V>> CacheListener<K, V> for DiskCache<K, V, B> {
    async fn handle_put(&self, element: CacheElement<K, V>) -> io::Result<()> {
        self.update(element)
    }

    async fn handle_remove(&self, _cache_name: &str, key: &K) -> io::Result<()> {
        self.remove(key).await.map(|_| ())
    }

    async fn handle_remove_all(&self, _cache_name: &str) -> io::Result<()> {
        self.remove_all().await.map(|_| ())
    }

    async fn handle_dispose(&self, _cache_name: &str) -> io::Result<()> {
        self.dispose().await
    }

    fn listener_id(&self) -> u64 {
        self.listener_id.load(Ordering::Relaxed)
    }

    fn set_listener_id(&self, id: u64) {
        self.listener_id.store(id, Ordering::Relaxed);
    }
}

#[async_trait]
impl<K: CacheKey, V: Cacheable, B: DiskBackend<K, V>> AuxiliaryCache<K, V> for DiskCache<K, V, B> {
    fn cache_name(&self) -> &str {
        &self.attributes.cache_name
    }

    fn kind(&self) -> AuxiliaryKind {
        AuxiliaryKind::Disk
    }

    fn status(&self) -> CacheStatus {
        DiskCache::status(self)
    }

    async fn get(&self, key: &K) -> io::Result<Option<CacheElement<K, V>>> {
        DiskCache::get(self, key).await
    }

    async fn get_matching(&self, pattern: &Regex) -> io::Result<HashMap<K, CacheElement<K, V>>> {
        DiskCache::get_matching(self, pattern).await
    }
}
