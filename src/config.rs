//! Sampler configuration.

use crate::error::{Result, StreamError};
use crate::limiter::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`Sampler`](crate::Sampler).
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Max queued change records before the oldest is evicted.
    /// Default: 1000
    pub queue_capacity: usize,

    /// Base delay between polling iterations.
    /// Default: 100ms (10 Hz)
    pub poll_interval_ms: u64,

    /// Delay before re-checking a target that reported not-ready.
    /// Default: 100ms
    pub not_ready_interval_ms: u64,

    /// How long `stop()` waits for the polling thread to exit.
    /// Default: 2s
    pub stop_timeout_ms: u64,

    /// Trace tail size used when a trace subscription does not specify one.
    /// Default: 50
    pub trace_tail_lines: usize,

    /// Max events requested per poll.
    /// Default: 20
    pub events_per_poll: usize,

    /// Per-category delivery budgets.
    pub rate_limits: RateLimitConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            poll_interval_ms: 100,
            not_ready_interval_ms: 100,
            stop_timeout_ms: 2000,
            trace_tail_lines: 50,
            events_per_poll: 20,
            rate_limits: RateLimitConfig::default(),
        }
    }
}

/// Server-level document that nests the sampler settings under `streaming`.
#[derive(Deserialize)]
struct ConfigDocument {
    streaming: SamplerConfig,
}

impl SamplerConfig {
    /// Parse JSON. Accepts either the bare settings object or a document
    /// with a top-level `streaming` section.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let config = if value.get("streaming").is_some() {
            serde_json::from_value::<ConfigDocument>(value)?.streaming
        } else {
            serde_json::from_value::<SamplerConfig>(value)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check for settings the sampler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(StreamError::Configuration(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.poll_interval_ms == 0 || self.not_ready_interval_ms == 0 {
            return Err(StreamError::Configuration(
                "poll_interval_ms and not_ready_interval_ms must be greater than zero".into(),
            ));
        }
        if self.trace_tail_lines == 0 || self.events_per_poll == 0 {
            return Err(StreamError::Configuration(
                "trace_tail_lines and events_per_poll must be greater than zero".into(),
            ));
        }
        self.rate_limits.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn not_ready_interval(&self) -> Duration {
        Duration::from_millis(self.not_ready_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Nominal polling rate, ignoring backoff.
    pub fn polling_rate_hz(&self) -> u64 {
        1000 / self.poll_interval_ms.max(1)
    }
}
