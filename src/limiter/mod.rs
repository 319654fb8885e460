//! Per-category rate limiting with exponential backoff.
//!
//! The limiter throttles what the sampler *records*, not consumer calls.
//! Each category (trace, events, memory) has a unit budget per one-second
//! window. Denials count as overruns; outstanding overruns produce a backoff
//! delay that the sampler adds to its polling cadence.

mod clock;
mod rate;

pub use clock::{Clock, ManualClock, SystemClock};
pub use rate::{Category, CategoryCounts, LimiterStats, RateLimitConfig, RateLimiter, WINDOW};
