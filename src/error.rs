//! Error types for the streaming engine.

use std::time::Duration;
use thiserror::Error;

/// Main error type for sampler and service operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Monitored target is not ready")]
    AdapterUnavailable,

    #[error("Adapter query failed: {0}")]
    Adapter(String),

    #[error("Sampling {feed} failed: {reason}")]
    Sampling { feed: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid subscription kind: {0}")]
    InvalidSubscriptionKind(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Sampler is running; stop it before polling manually")]
    AlreadyRunning,

    #[error("Sampler thread did not exit within {0:?}")]
    StopTimeout(Duration),

    #[error("Failed to spawn sampler thread: {0}")]
    Spawn(std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StreamError {
    /// Wrap an error raised while sampling a single feed.
    pub fn sampling(feed: impl Into<String>, source: &StreamError) -> Self {
        StreamError::Sampling {
            feed: feed.into(),
            reason: source.to_string(),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

/// Result type for streaming operations.
pub type Result<T> = std::result::Result<T, StreamError>;
