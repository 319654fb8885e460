//! The sampler: lifecycle, subscriptions and the consumer API.

use crate::adapter::TargetAdapter;
use crate::config::SamplerConfig;
use crate::cursor::CursorTracker;
use crate::error::{Result, StreamError};
use crate::limiter::{Clock, RateLimiter, SystemClock};
use crate::queue::ChangeQueue;
use crate::types::Sequence;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::types::{
    ChangeRecord, PollReport, SamplerStats, Subscription, SubscriptionSet, Unsubscribe,
};
use super::worker::{self, SamplerState, Shared};

/// Handle to a running polling thread.
struct Worker {
    join: JoinHandle<()>,
    shutdown: Sender<()>,
    exited: Receiver<()>,
}

/// Background sampler streaming deltas from a monitored target.
///
/// The sampler starts Stopped. `start()` spawns a single polling thread that
/// is the only producer of change records; every other method may be called
/// from any thread at any time, running or not.
pub struct Sampler {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Sampler {
    /// Create a stopped sampler. Fails on invalid configuration.
    pub fn new(adapter: Arc<dyn TargetAdapter>, config: SamplerConfig) -> Result<Self> {
        Self::with_clock(adapter, config, Arc::new(SystemClock))
    }

    /// Create a stopped sampler whose rate limiter reads time from `clock`.
    pub fn with_clock(
        adapter: Arc<dyn TargetAdapter>,
        config: SamplerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = RateLimiter::with_clock(config.rate_limits.clone(), clock)?;

        let state = SamplerState {
            subscriptions: SubscriptionSet::default(),
            queue: ChangeQueue::new(config.queue_capacity),
            next_sequence: Sequence::default(),
            samples_taken: 0,
            changes_detected: 0,
            sample_errors: 0,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                adapter,
                cursors: CursorTracker::new(),
                limiter,
                state: Mutex::new(state),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.shared.config
    }

    // --- Lifecycle ---

    /// Launch the polling thread. No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let (exited_tx, exited_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);

        let join = thread::Builder::new()
            .name("deltastream-sampler".to_string())
            .spawn(move || worker::run(shared, shutdown_rx, exited_tx))
            .map_err(StreamError::Spawn)?;

        *worker = Some(Worker {
            join,
            shutdown: shutdown_tx,
            exited: exited_rx,
        });
        info!("background sampler started");
        Ok(())
    }

    /// Signal the polling thread to exit and wait for it, up to the
    /// configured stop timeout. No-op if not running.
    ///
    /// On timeout the thread is detached and `StopTimeout` is returned; the
    /// sampler is Stopped either way and may be started again.
    pub fn stop(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };

        let _ = worker.shutdown.try_send(());
        let timeout = self.shared.config.stop_timeout();

        match worker.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join.join().is_err() {
                    error!("sampler thread panicked");
                }
                info!("background sampler stopped");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                // Dropping the handle detaches the thread; it exits on its
                // next shutdown check.
                warn!(?timeout, "sampler thread did not exit in time, detaching");
                Err(StreamError::StopTimeout(timeout))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Run a single polling iteration on the calling thread, without the
    /// inter-poll sleeps.
    ///
    /// Only a stopped sampler can be driven this way; while the polling
    /// thread runs it is the sole producer and this returns `AlreadyRunning`.
    /// The worker slot stays locked for the whole iteration, so `start()`
    /// waits for a manual poll to finish.
    pub fn poll_once(&self) -> Result<PollReport> {
        let worker = self.worker.lock();
        if worker.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        Ok(self.shared.poll_once())
    }

    // --- Subscriptions ---

    /// Start watching a feed.
    ///
    /// Trace and events are flags, so repeating them is harmless. Memory
    /// watches are appended as-is, duplicates included.
    pub fn subscribe(&self, subscription: Subscription) {
        let mut state = self.shared.state.lock();
        let subs = &mut state.subscriptions;
        match subscription {
            Subscription::Trace { max_lines_per_poll } => {
                subs.trace = true;
                subs.trace_lines_per_poll = Some(max_lines_per_poll);
                debug!(max_lines_per_poll, "subscribed to trace");
            }
            Subscription::Events => {
                subs.events = true;
                debug!("subscribed to events");
            }
            Subscription::Memory(watch) => {
                debug!(
                    region = %watch.region,
                    address = watch.address,
                    length = watch.length,
                    "added memory watch"
                );
                subs.memory_watches.push(watch);
            }
        }
    }

    /// Stop watching a feed. Returns the number of memory watches removed.
    pub fn unsubscribe(&self, target: Unsubscribe) -> usize {
        let mut state = self.shared.state.lock();
        let subs = &mut state.subscriptions;
        let before = subs.memory_watches.len();
        match target {
            Unsubscribe::Trace => {
                subs.trace = false;
                subs.trace_lines_per_poll = None;
            }
            Unsubscribe::Events => subs.events = false,
            Unsubscribe::MemoryAddress(address) => {
                subs.memory_watches.retain(|w| w.address != address);
            }
            Unsubscribe::MemoryWatch(watch) => {
                subs.memory_watches.retain(|w| *w != watch);
            }
        }
        let removed = before - subs.memory_watches.len();
        debug!(removed, "unsubscribed");
        removed
    }

    /// Current subscription set.
    pub fn subscriptions(&self) -> SubscriptionSet {
        self.shared.state.lock().subscriptions.clone()
    }

    // --- Consumer API ---

    /// Drain up to `max_count` of the oldest change records. Never blocks.
    pub fn get_changes(&self, max_count: usize) -> Vec<ChangeRecord> {
        self.shared.state.lock().queue.pop_up_to(max_count)
    }

    /// Consistent snapshot of counters, queue and limiter state.
    pub fn get_stats(&self) -> SamplerStats {
        let state = self.shared.state.lock();
        SamplerStats {
            samples_taken: state.samples_taken,
            changes_detected: state.changes_detected,
            items_dropped: state.queue.dropped_count(),
            sample_errors: state.sample_errors,
            queue_size: state.queue.len(),
            queue_max: state.queue.capacity(),
            subscriptions: state.subscriptions.summary(),
            rate_limiter: self.shared.limiter.stats(),
        }
    }

    /// Forget every cursor, so the next poll treats all feeds as new.
    pub fn reset_cursors(&self) {
        self.shared.cursors.reset(None);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "sampler did not stop cleanly on drop");
        }
    }
}
