//! Subscription, change record and statistics types.

use crate::adapter::{DebugEvent, TraceLine};
use crate::error::StreamError;
use crate::limiter::LimiterStats;
use crate::types::{Sequence, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of feed a consumer can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Trace,
    Events,
    Memory,
}

impl FeedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::Trace => "trace",
            FeedKind::Events => "events",
            FeedKind::Memory => "memory",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(FeedKind::Trace),
            "events" => Ok(FeedKind::Events),
            "memory" => Ok(FeedKind::Memory),
            other => Err(StreamError::InvalidSubscriptionKind(other.to_string())),
        }
    }
}

/// A watched memory range.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryWatch {
    pub region: String,
    pub address: u32,
    pub length: usize,
}

impl MemoryWatch {
    pub fn new(region: impl Into<String>, address: u32, length: usize) -> Self {
        Self {
            region: region.into(),
            address,
            length,
        }
    }

    /// Cursor key for this watch. Identical watches share a cursor.
    pub fn cursor_key(&self) -> String {
        format!("memory:{}:{}:{}", self.region, self.address, self.length)
    }

    /// Identifier reported back to the subscriber.
    pub fn subscription_id(&self) -> String {
        format!("memory_{}_{}_{}", self.region, self.address, self.length)
    }
}

/// A request to start watching a feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Subscription {
    /// Enable the trace feed, fetching up to `max_lines_per_poll` lines per poll.
    Trace { max_lines_per_poll: usize },
    /// Enable the events feed.
    Events,
    /// Add a memory watch. Duplicates are kept.
    Memory(MemoryWatch),
}

/// A request to stop watching a feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unsubscribe {
    Trace,
    Events,
    /// Remove every memory watch starting at this address, whatever its
    /// region or length.
    MemoryAddress(u32),
    /// Remove only watches equal to this one.
    MemoryWatch(MemoryWatch),
}

/// Active subscriptions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    pub trace: bool,
    /// Tail size for the trace feed; `None` uses the configured default.
    pub trace_lines_per_poll: Option<usize>,
    pub events: bool,
    pub memory_watches: Vec<MemoryWatch>,
}

impl SubscriptionSet {
    pub fn is_empty(&self) -> bool {
        !self.trace && !self.events && self.memory_watches.is_empty()
    }

    pub fn summary(&self) -> SubscriptionSummary {
        SubscriptionSummary {
            trace: self.trace,
            events: self.events,
            memory_watches: self.memory_watches.len(),
        }
    }
}

/// Counts-only view of the subscription set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSummary {
    pub trace: bool,
    pub events: bool,
    pub memory_watches: usize,
}

/// Kind-specific payload of a change record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeDelta {
    /// The trace grew.
    TraceDelta {
        /// Lines produced since the previous observation.
        new_lines: u64,
        /// First few of the new lines (at most 10).
        sample: Vec<TraceLine>,
        total_trace_lines: u64,
    },

    /// The event list changed.
    EventsDelta {
        event_count: usize,
        /// First few events of the new list (at most 5).
        events: Vec<DebugEvent>,
    },

    /// A watched memory range changed.
    MemoryDelta {
        region: String,
        address: u32,
        length: usize,
        /// Previous contents; absent on first observation.
        #[serde(with = "crate::types::hex_bytes_opt")]
        old_data: Option<Vec<u8>>,
        #[serde(with = "crate::types::hex_bytes")]
        new_data: Vec<u8>,
    },
}

impl ChangeDelta {
    pub fn kind(&self) -> FeedKind {
        match self {
            ChangeDelta::TraceDelta { .. } => FeedKind::Trace,
            ChangeDelta::EventsDelta { .. } => FeedKind::Events,
            ChangeDelta::MemoryDelta { .. } => FeedKind::Memory,
        }
    }
}

/// One delivered change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Insertion order, unique per sampler.
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub delta: ChangeDelta,
}

impl ChangeRecord {
    pub fn kind(&self) -> FeedKind {
        self.delta.kind()
    }
}

/// Result of sampling one feed once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// A change was found and queued.
    Delivered,
    /// A change was found but the rate limiter denied it.
    Suppressed,
    /// State matches the cursor.
    Unchanged,
    /// Nothing to compare (empty feed) or the cursor was rebased.
    Skipped,
}

/// Tally of one polling iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    /// False when the target was not ready and no feed was touched.
    pub ready: bool,
    pub delivered: usize,
    pub suppressed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl PollReport {
    pub(crate) fn record(&mut self, outcome: SampleOutcome) {
        match outcome {
            SampleOutcome::Delivered => self.delivered += 1,
            SampleOutcome::Suppressed => self.suppressed += 1,
            SampleOutcome::Unchanged => self.unchanged += 1,
            SampleOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Sampler statistics, captured atomically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplerStats {
    pub samples_taken: u64,
    pub changes_detected: u64,
    /// Records evicted from the queue by overflow.
    pub items_dropped: u64,
    /// Feed samples that failed with an error.
    pub sample_errors: u64,
    pub queue_size: usize,
    pub queue_max: usize,
    pub subscriptions: SubscriptionSummary,
    pub rate_limiter: LimiterStats,
}
