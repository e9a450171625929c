//! Listener and disk backend doubles shared by the unit tests

use async_trait::async_trait;
use regex::Regex;
use std::{
    collections::HashMap,
    io,
    sync::{
        Mutex,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    disk_cache::DiskBackend,
    element::CacheElement,
    listener::{AuxiliaryCache, AuxiliaryKind, CacheListener, CacheStatus},
};

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub(crate) async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Records every successfully handled event as a short string.
pub(crate) struct RecordingListener {
    events: Mutex<Vec<String>>,
    puts: AtomicUsize,
    attempts: AtomicUsize,
    fail_remaining: AtomicU32,
    always_fail: bool,
    delay: Duration,
    listener_id: AtomicU64,
}

impl RecordingListener {
    pub(crate) fn new() -> Self {
        Self::build(false, 0, Duration::ZERO)
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self::build(false, 0, delay)
    }

    pub(crate) fn failing() -> Self {
        Self::build(true, 0, Duration::ZERO)
    }

    pub(crate) fn failing_first(count: u32) -> Self {
        Self::build(false, count, Duration::ZERO)
    }

    fn build(always_fail: bool, fail_first: u32, delay: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            puts: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            fail_remaining: AtomicU32::new(fail_first),
            always_fail,
            delay,
            listener_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn record(&self, event: String) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted_failure = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.always_fail || scripted_failure {
            return Err(io::Error::other(format!("listener refused {}", event)));
        }
        if event.starts_with("put:") {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl CacheListener<String, String> for RecordingListener {
    async fn handle_put(&self, element: CacheElement<String, String>) -> io::Result<()> {
        self.record(format!("put:{}", element.key)).await
    }

    async fn handle_remove(&self, _cache_name: &str, key: &String) -> io::Result<()> {
        self.record(format!("remove:{}", key)).await
    }

    async fn handle_remove_all(&self, _cache_name: &str) -> io::Result<()> {
        self.record("removeAll".to_owned()).await
    }

    async fn handle_dispose(&self, _cache_name: &str) -> io::Result<()> {
        self.record("dispose".to_owned()).await
    }

    fn listener_id(&self) -> u64 {
        self.listener_id.load(Ordering::SeqCst)
    }

    fn set_listener_id(&self, id: u64) {
        self.listener_id.store(id, Ordering::SeqCst);
    }
}

/// Disk backend that keeps records in a map.
#[derive(Default)]
pub(crate) struct MapDiskBackend {
    map: Mutex<HashMap<String, CacheElement<String, String>>>,
    pub(crate) updates: AtomicUsize,
    pub(crate) remove_alls: AtomicUsize,
    pub(crate) disposed: AtomicUsize,
    /// Slows down writes so tests can observe queued elements
    pub(crate) write_delay: Duration,
}

impl MapDiskBackend {
    pub(crate) fn with_write_delay(write_delay: Duration) -> Self {
        Self {
            write_delay,
            ..Self::default()
        }
    }

    pub(crate) fn stored(&self, key: &str) -> Option<CacheElement<String, String>> {
        self.map.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

#[async_trait]
impl DiskBackend<String, String> for MapDiskBackend {
    async fn process_get(&self, key: &String) -> io::Result<Option<CacheElement<String, String>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn process_get_matching(
        &self,
        pattern: &Regex,
    ) -> io::Result<HashMap<String, CacheElement<String, String>>> {
        Ok(self
            .map
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| pattern.is_match(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn process_update(&self, element: CacheElement<String, String>) -> io::Result<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.map.lock().unwrap().insert(element.key.clone(), element);
        Ok(())
    }

    async fn process_remove(&self, key: &String) -> io::Result<bool> {
        Ok(self.map.lock().unwrap().remove(key).is_some())
    }

    async fn process_remove_all(&self) -> io::Result<()> {
        self.remove_alls.fetch_add(1, Ordering::SeqCst);
        self.map.lock().unwrap().clear();
        Ok(())
    }

    async fn process_dispose(&self) -> io::Result<()> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Non-disk tier that records what its queue delivers and stores nothing.
pub(crate) struct RecordingTier {
    pub(crate) kind: AuxiliaryKind,
    pub(crate) listener: RecordingListener,
}

impl RecordingTier {
    pub(crate) fn new(kind: AuxiliaryKind) -> Self {
        Self {
            kind,
            listener: RecordingListener::new(),
        }
    }

    pub(crate) fn failing(kind: AuxiliaryKind) -> Self {
        Self {
            kind,
            listener: RecordingListener::failing(),
        }
    }
}

#[async_trait]
impl CacheListener<String, String> for RecordingTier {
    async fn handle_put(&self, element: CacheElement<String, String>) -> io::Result<()> {
        self.listener.handle_put(element).await
    }

    async fn handle_remove(&self, cache_name: &str, key: &String) -> io::Result<()> {
        self.listener.handle_remove(cache_name, key).await
    }

    async fn handle_remove_all(&self, cache_name: &str) -> io::Result<()> {
        self.listener.handle_remove_all(cache_name).await
    }

    async fn handle_dispose(&self, cache_name: &str) -> io::Result<()> {
        self.listener.handle_dispose(cache_name).await
    }

    fn listener_id(&self) -> u64 {
        self.listener.listener_id()
    }

    fn set_listener_id(&self, id: u64) {
        self.listener.set_listener_id(id)
    }
}

#[async_trait]
impl AuxiliaryCache<String, String> for RecordingTier {
    fn cache_name(&self) -> &str {
        "recording"
    }

    fn kind(&self) -> AuxiliaryKind {
        self.kind
    }

    fn status(&self) -> CacheStatus {
        CacheStatus::Alive
    }

    async fn get(&self, _key: &String) -> io::Result<Option<CacheElement<String, String>>> {
        Ok(None)
    }

    async fn get_matching(
        &self,
        _pattern: &Regex,
    ) -> io::Result<HashMap<String, CacheElement<String, String>>> {
        Ok(HashMap::new())
    }
}
