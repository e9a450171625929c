//! Cache elements and their per-element policy

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fmt::Display,
    hash::Hash,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Trait for cache key types
///
/// Keys are matched against patterns through their `Display` form.
pub trait CacheKey: Display + Hash + Eq + Clone + Send + Sync + 'static {}
impl<T> CacheKey for T where T: Display + Hash + Eq + Clone + Send + Sync + 'static {}

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-element policy, attached when the element is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ElementAttributes {
    /// Eternal elements never expire by age or idleness
    pub is_eternal: bool,
    pub max_life_seconds: Option<u64>,
    /// Maximum time between accesses, enforced by the memory store
    pub idle_time_seconds: Option<u64>,
    /// May be written to disk tiers
    pub is_spool: bool,
    /// May be distributed to lateral peers
    pub is_lateral: bool,
    /// May be sent to remote servers
    pub is_remote: bool,
    pub create_time_millis: u64,
}

impl Default for ElementAttributes {
    fn default() -> Self {
        Self {
            is_eternal: true,
            max_life_seconds: None,
            idle_time_seconds: None,
            is_spool: true,
            is_lateral: true,
            is_remote: true,
            create_time_millis: 0,
        }
    }
}

impl ElementAttributes {
    /// Copy of these attributes stamped with the current time
    pub fn copy_with_create_time_now(&self) -> Self {
        Self {
            create_time_millis: now_millis(),
            ..self.clone()
        }
    }

    pub fn max_life(&self) -> Option<Duration> {
        self.max_life_seconds.map(Duration::from_secs)
    }

    pub fn idle_time(&self) -> Option<Duration> {
        self.idle_time_seconds.map(Duration::from_secs)
    }

    /// Whether the element has outlived its max life at `now_millis`
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        if self.is_eternal {
            return false;
        }
        match self.max_life_seconds {
            Some(max_life) if max_life > 0 => {
                now_millis.saturating_sub(self.create_time_millis) > max_life.saturating_mul(1000)
            }
            _ => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

/// Immutable value envelope exchanged between tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheElement<K, V> {
    pub cache_name: String,
    pub key: K,
    pub value: Arc<V>,
    pub attributes: ElementAttributes,
}

impl<K: CacheKey, V: Cacheable> CacheElement<K, V> {
    /// Create an element; the attributes are copied and stamped with the
    /// creation time.
    pub fn new(
        cache_name: impl Into<String>,
        key: K,
        value: V,
        attributes: &ElementAttributes,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            key,
            value: Arc::new(value),
            attributes: attributes.copy_with_create_time_now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.attributes.is_expired()
    }
}
