//! In-memory target used for scripting and tests.

use crate::error::{Result, StreamError};
use crate::limiter::Category;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{DebugEvent, EventList, TargetAdapter, TraceLine, TraceTail};

#[derive(Debug, Default)]
struct TargetState {
    ready: bool,
    trace: Vec<TraceLine>,
    events: Vec<DebugEvent>,
    regions: HashMap<String, Vec<u8>>,
    failing: HashSet<Category>,
}

/// A target whose state is set directly by the caller.
#[derive(Debug)]
pub struct MemoryTarget {
    state: RwLock<TargetState>,
    queries: AtomicU64,
}

impl MemoryTarget {
    /// Create a ready target with no trace, events or memory.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TargetState {
                ready: true,
                ..Default::default()
            }),
            queries: AtomicU64::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.write().ready = ready;
    }

    /// Append lines to the execution trace.
    pub fn push_trace(&self, lines: impl IntoIterator<Item = TraceLine>) {
        self.state.write().trace.extend(lines);
    }

    /// Drop all trace lines, as a target does when its trace buffer resets.
    pub fn clear_trace(&self) {
        self.state.write().trace.clear();
    }

    /// Replace the current event list.
    pub fn set_events(&self, events: Vec<DebugEvent>) {
        self.state.write().events = events;
    }

    /// Create or replace a memory region.
    pub fn set_region(&self, region: impl Into<String>, data: Vec<u8>) {
        self.state.write().regions.insert(region.into(), data);
    }

    /// Overwrite bytes inside an existing region.
    pub fn write_memory(&self, region: &str, address: u32, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let data = state
            .regions
            .get_mut(region)
            .ok_or_else(|| StreamError::Adapter(format!("unknown memory region: {}", region)))?;
        let start = address as usize;
        let end = start + bytes.len();
        if end > data.len() {
            return Err(StreamError::Adapter(format!(
                "write {}..{} out of bounds for {} ({} bytes)",
                start,
                end,
                region,
                data.len()
            )));
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Make every query for `category` fail until cleared.
    pub fn set_failing(&self, category: Category, failing: bool) {
        let mut state = self.state.write();
        if failing {
            state.failing.insert(category);
        } else {
            state.failing.remove(&category);
        }
    }

    /// Number of snapshot queries answered or failed so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn check_failing(&self, state: &TargetState, category: Category) -> Result<()> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if !state.ready {
            return Err(StreamError::AdapterUnavailable);
        }
        if state.failing.contains(&category) {
            return Err(StreamError::Adapter(format!("{} query failed", category)));
        }
        Ok(())
    }
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetAdapter for MemoryTarget {
    fn is_ready(&self) -> bool {
        self.state.read().ready
    }

    fn query_trace_tail(&self, count: usize) -> Result<TraceTail> {
        let state = self.state.read();
        self.check_failing(&state, Category::Trace)?;
        let start = state.trace.len().saturating_sub(count);
        Ok(TraceTail {
            total_count: state.trace.len() as u64,
            lines: state.trace[start..].to_vec(),
        })
    }

    fn query_events(&self, max: usize) -> Result<EventList> {
        let state = self.state.read();
        self.check_failing(&state, Category::Events)?;
        let start = state.events.len().saturating_sub(max);
        let events = state.events[start..].to_vec();
        Ok(EventList {
            count: events.len(),
            events,
        })
    }

    fn query_memory(&self, region: &str, address: u32, length: usize) -> Result<Vec<u8>> {
        let state = self.state.read();
        self.check_failing(&state, Category::Memory)?;
        let data = state
            .regions
            .get(region)
            .ok_or_else(|| StreamError::Adapter(format!("unknown memory region: {}", region)))?;
        let start = address as usize;
        let end = start.saturating_add(length);
        if end > data.len() {
            return Err(StreamError::Adapter(format!(
                "read {}..{} out of bounds for {} ({} bytes)",
                start,
                end,
                region,
                data.len()
            )));
        }
        Ok(data[start..end].to_vec())
    }
}
