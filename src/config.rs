//! Region, event queue and auxiliary configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::listener::AuxiliaryKind;

/// How a region feeds its disk tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskUsagePattern {
    /// Disk tiers only receive elements spooled out of memory.
    Swap,
    /// Every eligible put is also written to disk tiers.
    #[default]
    Update,
}

/// Configuration for one region's memory tier and spool behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CompositeCacheAttributes {
    /// Region name
    pub cache_name: String,
    /// Maximum number of elements held in memory before eviction
    pub max_objects: usize,
    /// Hand evicted elements to disk tiers instead of dropping them
    pub spool_on_evict: bool,
    pub disk_usage_pattern: DiskUsagePattern,
}

impl Default for CompositeCacheAttributes {
    fn default() -> Self {
        Self {
            cache_name: String::new(),
            max_objects: 100,
            spool_on_evict: true,
            disk_usage_pattern: DiskUsagePattern::default(),
        }
    }
}

impl CompositeCacheAttributes {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ..Self::default()
        }
    }
}

/// Retry and worker lifecycle settings for an event queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EventQueueConfig {
    /// Cumulative listener failures after which the queue destroys itself
    pub max_failure: u32,
    pub wait_before_retry_millis: u64,
    /// How long an idle worker waits for new events before exiting
    pub idle_time_millis: u64,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            max_failure: 3,
            wait_before_retry_millis: 500,
            idle_time_millis: 10_000,
        }
    }
}

impl EventQueueConfig {
    pub fn wait_before_retry(&self) -> Duration {
        Duration::from_millis(self.wait_before_retry_millis)
    }

    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.idle_time_millis)
    }
}

/// Configuration for one auxiliary tier of one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuxiliaryCacheAttributes {
    /// Auxiliary name as listed in the region definition
    pub name: String,
    /// Region this auxiliary serves
    pub cache_name: String,
    pub kind: AuxiliaryKind,
    /// When false the tier refuses removeAll and keeps its data
    pub allow_remove_all: bool,
    /// Upper bound on how long dispose waits for queued writes to finish
    pub shutdown_spool_time_limit_millis: u64,
    #[serde(flatten)]
    pub event_queue: EventQueueConfig,
    /// Backend-specific settings, passed through untouched
    #[serde(skip)]
    pub properties: HashMap<String, String>,
}

impl Default for AuxiliaryCacheAttributes {
    fn default() -> Self {
        Self {
            name: String::new(),
            cache_name: String::new(),
            kind: AuxiliaryKind::Disk,
            allow_remove_all: true,
            shutdown_spool_time_limit_millis: 60_000,
            event_queue: EventQueueConfig::default(),
            properties: HashMap::new(),
        }
    }
}

impl AuxiliaryCacheAttributes {
    pub fn new(name: impl Into<String>, cache_name: impl Into<String>, kind: AuxiliaryKind) -> Self {
        Self {
            name: name.into(),
            cache_name: cache_name.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn shutdown_spool_time_limit(&self) -> Duration {
        Duration::from_millis(self.shutdown_spool_time_limit_millis)
    }
}
