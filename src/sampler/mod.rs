//! Background sampler for change detection.
//!
//! A single polling thread watches the subscribed feeds of a monitored
//! target:
//! - Execution trace (growth in total line count)
//! - Debug events (fingerprint of the recent event list)
//! - Memory ranges (raw byte comparison)
//!
//! Detected changes pass through the rate limiter and land in a bounded
//! queue that consumers drain with [`Sampler::get_changes`]. Cursors advance
//! on every observation, so a change the limiter suppresses is never
//! re-delivered; the latest state always becomes the new baseline.
//!
//! # Example
//!
//! ```ignore
//! let target = Arc::new(MemoryTarget::new());
//! let sampler = Sampler::new(target.clone(), SamplerConfig::default())?;
//!
//! sampler.subscribe(Subscription::Trace { max_lines_per_poll: 100 });
//! sampler.subscribe(Subscription::Memory(MemoryWatch::new("wram", 0x10, 4)));
//! sampler.start()?;
//!
//! for change in sampler.get_changes(100) {
//!     println!("{:?}", change);
//! }
//! sampler.stop()?;
//! ```

mod manager;
mod types;
mod worker;

pub use manager::Sampler;
pub use types::{
    ChangeDelta, ChangeRecord, FeedKind, MemoryWatch, PollReport, SampleOutcome, SamplerStats,
    Subscription, SubscriptionSet, SubscriptionSummary, Unsubscribe,
};
