//! Capabilities implemented by every auxiliary tier
//!
//! Regions and event queues only ever talk to tiers through these traits:
//! - [`CacheListener`]: the four mutation verbs delivered by an event queue
//! - [`AuxiliaryCache`]: synchronous reads plus tier identity and status

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::element::{CacheElement, CacheKey, Cacheable};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique listener id
pub fn next_listener_id() -> u64 {
    NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Kind of secondary tier; decides which element flags gate propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuxiliaryKind {
    Disk,
    Lateral,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Alive,
    Disposed,
}

/// Receiver of asynchronously propagated cache mutations.
///
/// An event queue awaits each call before delivering the next event, so an
/// implementation sees events in enqueue order. Returning an error makes the
/// queue retry the same event.
#[async_trait]
pub trait CacheListener<K: CacheKey, V: Cacheable>: Send + Sync + 'static {
    async fn handle_put(&self, element: CacheElement<K, V>) -> io::Result<()>;

    async fn handle_remove(&self, cache_name: &str, key: &K) -> io::Result<()>;

    async fn handle_remove_all(&self, cache_name: &str) -> io::Result<()>;

    async fn handle_dispose(&self, cache_name: &str) -> io::Result<()>;

    fn listener_id(&self) -> u64;

    fn set_listener_id(&self, id: u64);
}

/// A secondary tier behind a region's memory store.
///
/// Reads go straight to the tier; mutations arrive through the
/// [`CacheListener`] verbs from the tier's event queue.
#[async_trait]
pub trait AuxiliaryCache<K: CacheKey, V: Cacheable>: CacheListener<K, V> {
    fn cache_name(&self) -> &str;

    fn kind(&self) -> AuxiliaryKind;

    fn status(&self) -> CacheStatus;

    async fn get(&self, key: &K) -> io::Result<Option<CacheElement<K, V>>>;

    /// All elements whose key display form matches `pattern`
    async fn get_matching(&self, pattern: &Regex) -> io::Result<HashMap<K, CacheElement<K, V>>>;

    /// Keys belonging to a group, for tiers that keep group membership.
    async fn group_keys(&self, group: &str) -> io::Result<HashSet<K>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("group key lookup not supported (group {})", group),
        ))
    }
}
