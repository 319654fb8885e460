//! Read-only view of the monitored target.
//!
//! The sampler only ever talks to the target through [`TargetAdapter`]. The
//! adapter is expected to answer synchronously and quickly; the sampler puts
//! no timeout around these calls, so an adapter that blocks stalls polling.

mod memory;

pub use memory::MemoryTarget;

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// One executed instruction as reported by the target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLine {
    pub pc: u32,
    /// Instruction bytes, formatted by the adapter.
    pub bytes: String,
    pub text: String,
}

impl TraceLine {
    pub fn new(pc: u32, bytes: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            pc,
            bytes: bytes.into(),
            text: text.into(),
        }
    }
}

/// Tail of the execution trace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceTail {
    /// Total lines the target has produced so far.
    pub total_count: u64,
    /// Most recent lines, oldest first.
    pub lines: Vec<TraceLine>,
}

/// Memory access attached to a debug event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOperation {
    pub address: u32,
    pub value: u32,
    #[serde(rename = "type")]
    pub op_type: String,
}

/// A discrete debugger event (interrupt, breakpoint hit, DMA, ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub pc: u32,
    pub scanline: i32,
    pub cycle: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dma_channel: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<MemoryOperation>,
}

impl DebugEvent {
    pub fn new(kind: impl Into<String>, pc: u32, scanline: i32, cycle: u32) -> Self {
        Self {
            kind: kind.into(),
            pc,
            scanline,
            cycle,
            breakpoint_id: None,
            dma_channel: None,
            operation: None,
        }
    }
}

/// Recent events reported by the target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventList {
    pub count: usize,
    pub events: Vec<DebugEvent>,
}

/// Snapshot queries against the monitored target.
pub trait TargetAdapter: Send + Sync {
    /// Whether the target can currently answer queries.
    fn is_ready(&self) -> bool;

    /// The last `count` trace lines plus the total produced so far.
    fn query_trace_tail(&self, count: usize) -> Result<TraceTail>;

    /// Up to `max` most recent events.
    fn query_events(&self, max: usize) -> Result<EventList>;

    /// `length` bytes of `region` starting at `address`.
    fn query_memory(&self, region: &str, address: u32, length: usize) -> Result<Vec<u8>>;
}
