//! Windowed unit budgets and the backoff ramp.

use crate::error::{Result, StreamError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::clock::{Clock, SystemClock};

/// Length of one budget window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// First step of the backoff ramp, in seconds.
const BACKOFF_BASE_SECS: f64 = 0.1;

/// Ceiling of the backoff ramp, in seconds.
const BACKOFF_MAX_SECS: f64 = 1.0;

/// Feed category a budget applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Trace,
    Events,
    Memory,
}

impl Category {
    fn index(self) -> usize {
        match self {
            Category::Trace => 0,
            Category::Events => 1,
            Category::Memory => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Trace => "trace",
            Category::Events => "events",
            Category::Memory => "memory",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Units allowed per second for each category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Default: 1000
    pub max_trace_lines_per_second: u64,
    /// Default: 100
    pub max_events_per_second: u64,
    /// Default: 50
    pub max_memory_changes_per_second: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_trace_lines_per_second: 1000,
            max_events_per_second: 100,
            max_memory_changes_per_second: 50,
        }
    }
}

impl RateLimitConfig {
    pub fn budget(&self, category: Category) -> u64 {
        match category {
            Category::Trace => self.max_trace_lines_per_second,
            Category::Events => self.max_events_per_second,
            Category::Memory => self.max_memory_changes_per_second,
        }
    }

    /// Reject budgets that could never admit a unit.
    pub fn validate(&self) -> Result<()> {
        for category in [Category::Trace, Category::Events, Category::Memory] {
            if self.budget(category) == 0 {
                return Err(StreamError::Configuration(format!(
                    "rate limit for {} must be greater than zero",
                    category
                )));
            }
        }
        Ok(())
    }
}

/// Units consumed per category in the current window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub trace: u64,
    pub events: u64,
    pub memory: u64,
}

/// Point-in-time view of the limiter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimiterStats {
    pub counters: CategoryCounts,
    pub consecutive_overruns: u32,
    pub backoff_delay: f64,
    pub config: RateLimitConfig,
}

#[derive(Debug)]
struct Budgets {
    counters: [u64; 3],
    window_start: Instant,
    /// Whether any category was denied since `window_start`.
    overran_in_window: bool,
    consecutive_overruns: u32,
}

impl Budgets {
    /// Start a new window if the current one has elapsed.
    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < WINDOW {
            return;
        }

        // More than one window since the last roll means at least one full
        // window passed with no calls, hence no overruns.
        let quiet = !self.overran_in_window || elapsed >= WINDOW * 2;

        self.counters = [0; 3];
        self.window_start = now;
        self.overran_in_window = false;
        if quiet {
            self.consecutive_overruns = 0;
        }
    }

    fn backoff(&self) -> Duration {
        if self.consecutive_overruns == 0 {
            return Duration::ZERO;
        }
        let exp = self.consecutive_overruns.min(16) as i32;
        let secs = (BACKOFF_BASE_SECS * 2f64.powi(exp)).min(BACKOFF_MAX_SECS);
        Duration::from_secs_f64(secs)
    }
}

/// Per-category budget over a rolling one-second window.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    budgets: Mutex<Budgets>,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            config,
            clock,
            budgets: Mutex::new(Budgets {
                counters: [0; 3],
                window_start: now,
                overran_in_window: false,
                consecutive_overruns: 0,
            }),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `units` of `category` may be recorded.
    ///
    /// The check is against what was already consumed in this window, so one
    /// large batch may overshoot the budget; the next call is then denied.
    pub fn should_include(&self, category: Category, units: u64) -> bool {
        let now = self.clock.now();
        let mut budgets = self.budgets.lock();
        budgets.roll(now);

        let idx = category.index();
        if budgets.counters[idx] >= self.config.budget(category) {
            budgets.consecutive_overruns = budgets.consecutive_overruns.saturating_add(1);
            budgets.overran_in_window = true;
            return false;
        }

        budgets.counters[idx] = budgets.counters[idx].saturating_add(units);
        true
    }

    /// Extra delay the sampler should wait before its next poll.
    ///
    /// Zero while no overrun is outstanding, otherwise
    /// `min(0.1s * 2^overruns, 1s)`.
    pub fn backoff_delay(&self) -> Duration {
        let now = self.clock.now();
        let mut budgets = self.budgets.lock();
        budgets.roll(now);
        budgets.backoff()
    }

    pub fn consecutive_overruns(&self) -> u32 {
        self.budgets.lock().consecutive_overruns
    }

    pub fn stats(&self) -> LimiterStats {
        let now = self.clock.now();
        let mut budgets = self.budgets.lock();
        budgets.roll(now);
        LimiterStats {
            counters: CategoryCounts {
                trace: budgets.counters[0],
                events: budgets.counters[1],
                memory: budgets.counters[2],
            },
            consecutive_overruns: budgets.consecutive_overruns,
            backoff_delay: budgets.backoff().as_secs_f64(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::ManualClock;

    fn limiter(trace: u64, events: u64, memory: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(
            RateLimitConfig {
                max_trace_lines_per_second: trace,
                max_events_per_second: events,
                max_memory_changes_per_second: memory,
            },
            clock.clone(),
        )
        .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_exact_budget_then_deny() {
        let (limiter, _clock) = limiter(100, 10, 5);

        for _ in 0..100 {
            assert!(limiter.should_include(Category::Trace, 1));
        }
        assert!(!limiter.should_include(Category::Trace, 1));

        // Other categories are independent.
        assert!(limiter.should_include(Category::Events, 1));
        assert!(limiter.should_include(Category::Memory, 1));
    }

    #[test]
    fn test_batch_may_overshoot_once() {
        let (limiter, _clock) = limiter(10, 10, 10);

        assert!(limiter.should_include(Category::Trace, 50));
        assert!(!limiter.should_include(Category::Trace, 1));
        assert_eq!(limiter.stats().counters.trace, 50);
    }

    #[test]
    fn test_window_resets_counters() {
        let (limiter, clock) = limiter(10, 10, 10);

        for _ in 0..10 {
            assert!(limiter.should_include(Category::Trace, 1));
        }
        assert!(!limiter.should_include(Category::Trace, 1));

        clock.advance(Duration::from_millis(1100));
        assert!(limiter.should_include(Category::Trace, 1));
        assert_eq!(limiter.stats().counters.trace, 1);
    }

    #[test]
    fn test_no_reset_inside_window() {
        let (limiter, clock) = limiter(2, 10, 10);

        assert!(limiter.should_include(Category::Trace, 2));
        clock.advance(Duration::from_millis(999));
        assert!(!limiter.should_include(Category::Trace, 1));
    }

    #[test]
    fn test_backoff_ramp_and_cap() {
        let (limiter, _clock) = limiter(1, 10, 10);
        assert_eq!(limiter.backoff_delay(), Duration::ZERO);

        assert!(limiter.should_include(Category::Trace, 1));

        let mut previous = Duration::ZERO;
        for n in 1..=10u32 {
            assert!(!limiter.should_include(Category::Trace, 1));
            let delay = limiter.backoff_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(1));
            if n == 1 {
                assert_eq!(delay, Duration::from_secs_f64(0.2));
            }
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(1));
        assert_eq!(limiter.consecutive_overruns(), 10);
    }

    #[test]
    fn test_backoff_survives_boundary_after_overrun_window() {
        let (limiter, clock) = limiter(1, 10, 10);

        assert!(limiter.should_include(Category::Trace, 1));
        assert!(!limiter.should_include(Category::Trace, 1));
        let before = limiter.backoff_delay();
        assert!(before > Duration::ZERO);

        // The window that just ended had an overrun, so backoff persists.
        clock.advance(Duration::from_millis(1100));
        assert!(limiter.should_include(Category::Trace, 1));
        assert_eq!(limiter.backoff_delay(), before);

        // This window stays quiet; the next boundary clears backoff.
        clock.advance(Duration::from_millis(1100));
        assert_eq!(limiter.backoff_delay(), Duration::ZERO);
        assert_eq!(limiter.consecutive_overruns(), 0);
    }

    #[test]
    fn test_long_idle_clears_backoff() {
        let (limiter, clock) = limiter(1, 10, 10);

        assert!(limiter.should_include(Category::Memory, 1));
        assert!(limiter.should_include(Category::Trace, 1));
        assert!(!limiter.should_include(Category::Trace, 1));

        clock.advance(Duration::from_millis(2500));
        assert_eq!(limiter.backoff_delay(), Duration::ZERO);
    }

    #[test]
    fn test_overrun_in_any_category_blocks_reset() {
        let (limiter, clock) = limiter(10, 1, 10);

        assert!(limiter.should_include(Category::Events, 1));
        assert!(!limiter.should_include(Category::Events, 1));

        clock.advance(Duration::from_millis(1100));
        assert!(limiter.should_include(Category::Events, 1));
        assert!(!limiter.should_include(Category::Events, 1));

        clock.advance(Duration::from_millis(1100));
        // Two overruns, neither cleared.
        assert_eq!(limiter.consecutive_overruns(), 2);
        assert_eq!(limiter.backoff_delay(), Duration::from_secs_f64(0.4));
    }

    #[test]
    fn test_zero_budget_is_configuration_error() {
        let result = RateLimiter::new(RateLimitConfig {
            max_events_per_second: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(StreamError::Configuration(_))));
    }

    #[test]
    fn test_stats_reports_config() {
        let (limiter, _clock) = limiter(7, 8, 9);
        let stats = limiter.stats();
        assert_eq!(stats.config.max_trace_lines_per_second, 7);
        assert_eq!(stats.counters, CategoryCounts::default());
        assert_eq!(stats.backoff_delay, 0.0);
    }
}
