//! Cache error types

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The event queue was destroyed, either explicitly or after too many
    /// listener failures, and no longer accepts events.
    #[error("Event queue for cache [{cache_name}] (listener {listener_id}) is destroyed")]
    QueueDestroyed { cache_name: String, listener_id: u64 },

    #[error("Region [{0}] is disposed")]
    Disposed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
