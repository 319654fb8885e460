//! Background polling loop and per-feed delta detection.

use crate::adapter::TargetAdapter;
use crate::config::SamplerConfig;
use crate::cursor::{CursorTracker, CursorValue};
use crate::error::{Result, StreamError};
use crate::limiter::{Category, RateLimiter};
use crate::queue::ChangeQueue;
use crate::types::{Fingerprint, Sequence, Timestamp};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::types::{
    ChangeDelta, ChangeRecord, MemoryWatch, PollReport, SampleOutcome, SubscriptionSet,
};

/// Cursor key for the trace feed (total lines seen).
pub(crate) const TRACE_CURSOR: &str = "trace";

/// Cursor key for the events feed (fingerprint of the last list).
pub(crate) const EVENTS_CURSOR: &str = "events_hash";

/// Max trace lines carried in one record.
const TRACE_SAMPLE_LINES: usize = 10;

/// Max events carried in one record.
const EVENTS_SAMPLE: usize = 5;

/// Mutable sampler state guarded by a single lock.
#[derive(Debug)]
pub(crate) struct SamplerState {
    pub subscriptions: SubscriptionSet,
    pub queue: ChangeQueue<ChangeRecord>,
    pub next_sequence: Sequence,
    pub samples_taken: u64,
    pub changes_detected: u64,
    pub sample_errors: u64,
}

/// Everything the consumer API and the polling thread share.
pub(crate) struct Shared {
    pub config: SamplerConfig,
    pub adapter: Arc<dyn TargetAdapter>,
    pub cursors: CursorTracker,
    pub limiter: RateLimiter,
    pub state: Mutex<SamplerState>,
}

impl Shared {
    /// Run one polling iteration without sleeping.
    pub fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        if !self.adapter.is_ready() {
            return report;
        }
        report.ready = true;

        let subscriptions = {
            let mut state = self.state.lock();
            state.samples_taken += 1;
            state.subscriptions.clone()
        };

        if subscriptions.trace {
            let lines = subscriptions
                .trace_lines_per_poll
                .unwrap_or(self.config.trace_tail_lines);
            self.settle("trace", self.sample_trace(lines), &mut report);
        }

        if subscriptions.events {
            self.settle("events", self.sample_events(), &mut report);
        }

        for watch in &subscriptions.memory_watches {
            let outcome = self.sample_memory(watch);
            self.settle(&watch.subscription_id(), outcome, &mut report);
        }

        report
    }

    /// Fold one feed result into the report. Errors stop here.
    fn settle(&self, feed: &str, result: Result<SampleOutcome>, report: &mut PollReport) {
        match result {
            Ok(outcome) => {
                if outcome == SampleOutcome::Suppressed {
                    debug!(feed, "change suppressed by rate limiter");
                }
                report.record(outcome);
            }
            Err(e) => {
                let e = StreamError::sampling(feed, &e);
                warn!(error = %e, "feed sampling failed");
                self.state.lock().sample_errors += 1;
                report.errors += 1;
            }
        }
    }

    fn push_change(&self, delta: ChangeDelta) {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence = sequence.next();

        let record = ChangeRecord {
            sequence,
            timestamp: Timestamp::now(),
            delta,
        };
        if state.queue.push(record).is_some() {
            trace!(dropped = state.queue.dropped_count(), "change queue full, evicted oldest");
        }
        state.changes_detected += 1;
    }

    fn sample_trace(&self, max_lines: usize) -> Result<SampleOutcome> {
        let tail = self.adapter.query_trace_tail(max_lines)?;
        if tail.lines.is_empty() {
            return Ok(SampleOutcome::Skipped);
        }

        let last = self
            .cursors
            .get(TRACE_CURSOR, CursorValue::Position(0))
            .as_position()
            .unwrap_or(0);
        let total = tail.total_count;

        if total == last {
            return Ok(SampleOutcome::Unchanged);
        }
        if total < last {
            // Target trace buffer was cleared; start counting again from here.
            debug!(last, total, "trace shrank, rebasing cursor");
            self.cursors.set(TRACE_CURSOR, CursorValue::Position(total));
            return Ok(SampleOutcome::Skipped);
        }

        let new_lines = total - last;
        let observed = (new_lines.min(tail.lines.len() as u64)) as usize;

        let outcome = if self.limiter.should_include(Category::Trace, observed as u64) {
            let first_new = tail.lines.len() - observed;
            let sample = tail.lines[first_new..]
                .iter()
                .take(TRACE_SAMPLE_LINES)
                .cloned()
                .collect();
            self.push_change(ChangeDelta::TraceDelta {
                new_lines,
                sample,
                total_trace_lines: total,
            });
            SampleOutcome::Delivered
        } else {
            SampleOutcome::Suppressed
        };

        self.cursors.set(TRACE_CURSOR, CursorValue::Position(total));
        Ok(outcome)
    }

    fn sample_events(&self) -> Result<SampleOutcome> {
        let list = self.adapter.query_events(self.config.events_per_poll)?;
        if list.events.is_empty() {
            return Ok(SampleOutcome::Skipped);
        }

        let parts: Vec<Vec<u8>> = list
            .events
            .iter()
            .flat_map(|e| {
                [
                    e.kind.as_bytes().to_vec(),
                    e.pc.to_le_bytes().to_vec(),
                    e.scanline.to_le_bytes().to_vec(),
                ]
            })
            .collect();
        let fingerprint = Fingerprint::from_parts(parts.iter().map(Vec::as_slice));

        let last = self
            .cursors
            .get_opt(EVENTS_CURSOR)
            .and_then(|c| c.as_fingerprint());
        if last == Some(fingerprint) {
            return Ok(SampleOutcome::Unchanged);
        }

        let outcome = if self
            .limiter
            .should_include(Category::Events, list.events.len() as u64)
        {
            trace!(%fingerprint, "event list changed");
            let event_count = list.events.len();
            let mut events = list.events;
            events.truncate(EVENTS_SAMPLE);
            self.push_change(ChangeDelta::EventsDelta { event_count, events });
            SampleOutcome::Delivered
        } else {
            SampleOutcome::Suppressed
        };

        self.cursors
            .set(EVENTS_CURSOR, CursorValue::Fingerprint(fingerprint));
        Ok(outcome)
    }

    fn sample_memory(&self, watch: &MemoryWatch) -> Result<SampleOutcome> {
        let data = self
            .adapter
            .query_memory(&watch.region, watch.address, watch.length)?;

        let key = watch.cursor_key();
        let old_data = match self.cursors.get_opt(&key) {
            Some(CursorValue::Bytes(previous)) => Some(previous),
            _ => None,
        };
        if old_data.as_deref() == Some(data.as_slice()) {
            return Ok(SampleOutcome::Unchanged);
        }

        let outcome = if self.limiter.should_include(Category::Memory, 1) {
            self.push_change(ChangeDelta::MemoryDelta {
                region: watch.region.clone(),
                address: watch.address,
                length: watch.length,
                old_data,
                new_data: data.clone(),
            });
            SampleOutcome::Delivered
        } else {
            SampleOutcome::Suppressed
        };

        self.cursors.set(key, CursorValue::Bytes(data));
        Ok(outcome)
    }
}

/// Wait on the shutdown channel. Returns false once shutdown was requested.
fn idle(shutdown: &Receiver<()>, duration: Duration) -> bool {
    matches!(shutdown.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
}

/// Body of the polling thread.
pub(crate) fn run(shared: Arc<Shared>, shutdown: Receiver<()>, exited: Sender<()>) {
    info!(
        rate_hz = shared.config.polling_rate_hz(),
        "sampler loop started"
    );

    loop {
        let report = shared.poll_once();

        if !report.ready {
            trace!("target not ready");
            if !idle(&shutdown, shared.config.not_ready_interval()) {
                break;
            }
            continue;
        }

        trace!(?report, "poll complete");

        let backoff = shared.limiter.backoff_delay();
        if !backoff.is_zero() {
            debug!(backoff_ms = backoff.as_millis() as u64, "rate limit backoff");
            if !idle(&shutdown, backoff) {
                break;
            }
        }

        if !idle(&shutdown, shared.config.poll_interval()) {
            break;
        }
    }

    info!("sampler loop exited");
    let _ = exited.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DebugEvent, MemoryTarget, TraceLine};
    use crate::limiter::RateLimitConfig;

    fn shared_with(target: Arc<MemoryTarget>, config: SamplerConfig) -> Shared {
        Shared {
            limiter: RateLimiter::new(config.rate_limits.clone()).unwrap(),
            state: Mutex::new(SamplerState {
                subscriptions: SubscriptionSet::default(),
                queue: ChangeQueue::new(config.queue_capacity),
                next_sequence: Sequence::default(),
                samples_taken: 0,
                changes_detected: 0,
                sample_errors: 0,
            }),
            cursors: CursorTracker::new(),
            adapter: target,
            config,
        }
    }

    fn lines(range: std::ops::Range<u32>) -> Vec<TraceLine> {
        range.map(|i| TraceLine::new(i, "EA", format!("line {}", i))).collect()
    }

    #[test]
    fn test_trace_delta_reports_only_new_lines() {
        let target = Arc::new(MemoryTarget::new());
        let shared = shared_with(target.clone(), SamplerConfig::default());

        target.push_trace(lines(0..30));
        assert_eq!(shared.sample_trace(50).unwrap(), SampleOutcome::Delivered);

        target.push_trace(lines(30..33));
        assert_eq!(shared.sample_trace(50).unwrap(), SampleOutcome::Delivered);
        assert_eq!(shared.sample_trace(50).unwrap(), SampleOutcome::Unchanged);

        let records = shared.state.lock().queue.pop_up_to(10);
        assert_eq!(records.len(), 2);
        match &records[0].delta {
            ChangeDelta::TraceDelta { new_lines, sample, total_trace_lines } => {
                assert_eq!(*new_lines, 30);
                assert_eq!(*total_trace_lines, 30);
                assert_eq!(sample.len(), 10);
                assert_eq!(sample[0].pc, 0);
            }
            other => panic!("expected trace delta, got {:?}", other),
        }
        match &records[1].delta {
            ChangeDelta::TraceDelta { new_lines, sample, .. } => {
                assert_eq!(*new_lines, 3);
                assert_eq!(sample.iter().map(|l| l.pc).collect::<Vec<_>>(), vec![30, 31, 32]);
            }
            other => panic!("expected trace delta, got {:?}", other),
        }
        assert!(records[0].sequence < records[1].sequence);
    }

    #[test]
    fn test_trace_shrink_rebases_cursor() {
        let target = Arc::new(MemoryTarget::new());
        let shared = shared_with(target.clone(), SamplerConfig::default());

        target.push_trace(lines(0..20));
        shared.sample_trace(50).unwrap();

        target.clear_trace();
        target.push_trace(lines(0..5));
        assert_eq!(shared.sample_trace(50).unwrap(), SampleOutcome::Skipped);
        assert_eq!(shared.cursors.get_opt(TRACE_CURSOR), Some(CursorValue::Position(5)));

        target.push_trace(lines(5..7));
        assert_eq!(shared.sample_trace(50).unwrap(), SampleOutcome::Delivered);
    }

    #[test]
    fn test_suppressed_change_still_advances_cursor() {
        let target = Arc::new(MemoryTarget::new());
        let config = SamplerConfig {
            rate_limits: RateLimitConfig {
                max_memory_changes_per_second: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let shared = shared_with(target.clone(), config);
        let watch = MemoryWatch::new("wram", 0, 2);

        target.set_region("wram", vec![0, 0]);
        assert_eq!(shared.sample_memory(&watch).unwrap(), SampleOutcome::Delivered);

        target.write_memory("wram", 0, &[1, 1]).unwrap();
        assert_eq!(shared.sample_memory(&watch).unwrap(), SampleOutcome::Suppressed);
        assert_eq!(
            shared.cursors.get_opt(&watch.cursor_key()),
            Some(CursorValue::Bytes(vec![1, 1]))
        );

        // The suppressed observation is the new baseline.
        assert_eq!(shared.sample_memory(&watch).unwrap(), SampleOutcome::Unchanged);
        assert_eq!(shared.state.lock().changes_detected, 1);
    }

    #[test]
    fn test_memory_delta_carries_old_and_new() {
        let target = Arc::new(MemoryTarget::new());
        let shared = shared_with(target.clone(), SamplerConfig::default());
        let watch = MemoryWatch::new("wram", 4, 2);

        target.set_region("wram", vec![0; 8]);
        shared.sample_memory(&watch).unwrap();
        target.write_memory("wram", 4, &[0xAB, 0xCD]).unwrap();
        shared.sample_memory(&watch).unwrap();

        let records = shared.state.lock().queue.pop_up_to(10);
        assert_eq!(records.len(), 2);
        match &records[1].delta {
            ChangeDelta::MemoryDelta { old_data, new_data, address, .. } => {
                assert_eq!(*address, 4);
                assert_eq!(old_data.as_deref(), Some(&[0, 0][..]));
                assert_eq!(new_data, &vec![0xAB, 0xCD]);
            }
            other => panic!("expected memory delta, got {:?}", other),
        }
    }

    #[test]
    fn test_events_fingerprint_ignores_cycle() {
        let target = Arc::new(MemoryTarget::new());
        let shared = shared_with(target.clone(), SamplerConfig::default());

        target.set_events(vec![DebugEvent::new("Nmi", 0x8000, 241, 10)]);
        assert_eq!(shared.sample_events().unwrap(), SampleOutcome::Delivered);

        target.set_events(vec![DebugEvent::new("Nmi", 0x8000, 241, 99)]);
        assert_eq!(shared.sample_events().unwrap(), SampleOutcome::Unchanged);

        target.set_events(vec![DebugEvent::new("Irq", 0x8000, 241, 99)]);
        assert_eq!(shared.sample_events().unwrap(), SampleOutcome::Delivered);
    }

    #[test]
    fn test_events_record_is_truncated() {
        let target = Arc::new(MemoryTarget::new());
        let shared = shared_with(target.clone(), SamplerConfig::default());

        target.set_events((0..12).map(|i| DebugEvent::new("Irq", i, 0, 0)).collect());
        shared.sample_events().unwrap();

        let records = shared.state.lock().queue.pop_up_to(1);
        match &records[0].delta {
            ChangeDelta::EventsDelta { event_count, events } => {
                assert_eq!(*event_count, 12);
                assert_eq!(events.len(), 5);
            }
            other => panic!("expected events delta, got {:?}", other),
        }
    }

    #[test]
    fn test_failing_feed_does_not_block_others() {
        let target = Arc::new(MemoryTarget::new());
        let shared = shared_with(target.clone(), SamplerConfig::default());
        {
            let mut state = shared.state.lock();
            state.subscriptions.trace = true;
            state.subscriptions.memory_watches.push(MemoryWatch::new("missing", 0, 1));
            state.subscriptions.memory_watches.push(MemoryWatch::new("wram", 0, 1));
        }
        target.set_region("wram", vec![7]);
        target.push_trace(lines(0..3));
        target.set_failing(Category::Trace, true);

        let report = shared.poll_once();
        assert!(report.ready);
        assert_eq!(report.errors, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(shared.state.lock().sample_errors, 2);

        target.set_failing(Category::Trace, false);
        let report = shared.poll_once();
        assert_eq!(report.errors, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.unchanged, 1);
    }

    #[test]
    fn test_not_ready_touches_nothing() {
        let target = Arc::new(MemoryTarget::new());
        let shared = shared_with(target.clone(), SamplerConfig::default());
        shared.state.lock().subscriptions.trace = true;
        target.push_trace(lines(0..3));
        target.set_ready(false);

        let report = shared.poll_once();
        assert!(!report.ready);
        assert_eq!(shared.state.lock().samples_taken, 0);
        assert!(shared.cursors.is_empty());
        assert_eq!(target.query_count(), 0);
    }
}
