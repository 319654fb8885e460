//! # deltastream
//!
//! Background change detection and rate-limited delta streaming for a
//! monitored debugger target.
//!
//! ## Core Concepts
//!
//! - **Sampler**: Polls subscribed feeds on a background thread
//! - **Cursors**: Last-observed state per feed, used to compute deltas
//! - **Rate limiting**: Per-category budgets with exponential backoff
//! - **Change queue**: Bounded FIFO that drops the oldest record on overflow
//!
//! ## Example
//!
//! ```ignore
//! use deltastream::{MemoryTarget, SamplerConfig, StreamingService};
//!
//! let target = Arc::new(MemoryTarget::new());
//! let service = StreamingService::new(target, SamplerConfig::default())?;
//!
//! service.subscribe_trace(Some(100));
//! service.subscribe_memory("wram", 0x7E0000, Some(16));
//! service.start_streaming()?;
//!
//! // Later, from any thread
//! let batch = service.get_changes(Some(50));
//! println!("{} changes", batch.change_count);
//! ```

pub mod adapter;
pub mod config;
pub mod cursor;
pub mod error;
pub mod limiter;
pub mod queue;
pub mod sampler;
pub mod service;
pub mod types;

// Re-exports
pub use adapter::{
    DebugEvent, EventList, MemoryOperation, MemoryTarget, TargetAdapter, TraceLine, TraceTail,
};
pub use config::SamplerConfig;
pub use cursor::{CursorTracker, CursorValue};
pub use error::{Result, StreamError};
pub use limiter::{
    Category, CategoryCounts, Clock, LimiterStats, ManualClock, RateLimitConfig, RateLimiter,
    SystemClock,
};
pub use queue::ChangeQueue;
pub use sampler::{
    ChangeDelta, ChangeRecord, FeedKind, MemoryWatch, PollReport, SampleOutcome, Sampler,
    SamplerStats, Subscription, SubscriptionSet, SubscriptionSummary, Unsubscribe,
};
pub use service::StreamingService;
pub use types::{Fingerprint, Sequence, Timestamp};
