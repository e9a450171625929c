//! regioncache - Named cache regions with asynchronously fed auxiliary tiers
//!
//! Each region keeps a memory tier and an ordered list of auxiliary tiers:
//! - Memory: LRU store consulted first, bounded by `max_objects`
//! - Disk: elements spooled out of memory or written through on update
//! - Lateral / Remote: peers and servers reached through user-supplied tiers
//!
//! The cache supports:
//! - Per-tier event queues, so a slow or failing tier never blocks callers
//! - Bounded retry, after which a tier's queue retires itself
//! - Promotion of auxiliary hits back into memory
//! - Properties-driven configuration of regions and their tiers

mod config;
pub mod configurator;
pub mod disk_cache;
pub mod element;
mod error;
pub mod event_queue;
pub mod listener;
pub mod memory;
mod region_cache;

#[cfg(test)]
mod test_support;

pub use config::{AuxiliaryCacheAttributes, CompositeCacheAttributes, DiskUsagePattern, EventQueueConfig};
pub use configurator::{AuxiliaryFactory, CacheConfigurator, DiskCacheFactory, parse_properties};
pub use disk_cache::{DiskBackend, DiskCache, DiskCacheStats};
pub use element::{CacheElement, CacheKey, Cacheable, ElementAttributes};
pub use error::CacheError;
pub use event_queue::{CacheEvent, CacheEventQueue, EventQueueStats};
pub use listener::{AuxiliaryCache, AuxiliaryKind, CacheListener, CacheStatus};
pub use memory::{LruMemoryStore, MemoryStore};
pub use region_cache::{AuxiliaryTier, RegionCache, RegionCacheBuilder, RegionStats};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
