//! Named streaming operations for a request-dispatch layer.
//!
//! [`StreamingService`] owns one [`Sampler`] and exposes the operations a
//! debugging-control server routes to it. Oversized arguments are clamped
//! rather than rejected; only unknown operations, unknown subscription kinds
//! and malformed parameters produce errors.

use crate::adapter::TargetAdapter;
use crate::config::SamplerConfig;
use crate::error::{Result, StreamError};
use crate::sampler::{
    ChangeRecord, FeedKind, MemoryWatch, Sampler, SamplerStats, Subscription, Unsubscribe,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Trace lines fetched per poll when the subscriber does not say.
pub const DEFAULT_MAX_LINES_PER_POLL: usize = 100;

/// Upper bound on trace lines fetched per poll.
pub const MAX_LINES_PER_POLL: usize = 1000;

/// Memory watch length when the subscriber does not say.
pub const DEFAULT_WATCH_LENGTH: usize = 1;

/// Upper bound on a single memory watch.
pub const MAX_WATCH_LENGTH: usize = 256;

/// Records returned by `get_changes` when the caller does not say.
pub const DEFAULT_MAX_CHANGES: usize = 100;

/// Upper bound on records returned by one `get_changes` call.
pub const MAX_CHANGES_PER_CALL: usize = 1000;

// --- Responses ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartStreamingResponse {
    pub streaming: bool,
    pub status: String,
    pub polling_rate_hz: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopStreamingResponse {
    pub streaming: bool,
    pub status: String,
    pub final_stats: SamplerStats,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeTraceResponse {
    pub subscribed: bool,
    pub subscription_id: String,
    pub max_lines_per_poll: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeEventsResponse {
    pub subscribed: bool,
    pub subscription_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeMemoryResponse {
    pub subscribed: bool,
    pub subscription_id: String,
    pub region: String,
    pub address: u32,
    pub length: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnsubscribeMemoryResponse {
    pub unsubscribed: bool,
    pub address: u32,
    /// Number of watches removed.
    pub removed: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    pub unsubscribed: bool,
    pub subscription_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetChangesResponse {
    pub change_count: usize,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamingStatusResponse {
    pub streaming: bool,
    pub stats: SamplerStats,
}

// --- Parameters ---

#[derive(Debug, Default, Deserialize)]
struct TraceParams {
    max_lines_per_poll: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct MemoryParams {
    #[serde(alias = "memory_type")]
    region: String,
    address: u32,
    length: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AddressParams {
    address: u32,
    #[serde(default, alias = "memory_type")]
    region: Option<String>,
    #[serde(default)]
    length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ChangesParams {
    max_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct KindParams {
    kind: String,
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| StreamError::InvalidParams(e.to_string()))
}

fn to_value<T: Serialize>(response: T) -> Result<Value> {
    Ok(serde_json::to_value(response)?)
}

/// Streaming operations backed by an owned sampler.
pub struct StreamingService {
    sampler: Sampler,
}

impl StreamingService {
    pub fn new(adapter: Arc<dyn TargetAdapter>, config: SamplerConfig) -> Result<Self> {
        Ok(Self {
            sampler: Sampler::new(adapter, config)?,
        })
    }

    pub fn from_sampler(sampler: Sampler) -> Self {
        Self { sampler }
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn start_streaming(&self) -> Result<StartStreamingResponse> {
        self.sampler.start()?;
        Ok(StartStreamingResponse {
            streaming: true,
            status: "Background sampler started".to_string(),
            polling_rate_hz: self.sampler.config().polling_rate_hz(),
        })
    }

    /// Stop the sampler and report the statistics it ended with.
    ///
    /// A stop timeout is logged and reported in `status`; the sampler is
    /// considered stopped regardless.
    pub fn stop_streaming(&self) -> StopStreamingResponse {
        let final_stats = self.sampler.get_stats();
        let status = match self.sampler.stop() {
            Ok(()) => "Background sampler stopped".to_string(),
            Err(e) => {
                warn!(error = %e, "stop_streaming did not shut down cleanly");
                format!("Background sampler stopped with fault: {}", e)
            }
        };
        StopStreamingResponse {
            streaming: false,
            status,
            final_stats,
        }
    }

    pub fn subscribe_trace(&self, max_lines_per_poll: Option<usize>) -> SubscribeTraceResponse {
        let max_lines_per_poll = max_lines_per_poll
            .unwrap_or(DEFAULT_MAX_LINES_PER_POLL)
            .clamp(1, MAX_LINES_PER_POLL);
        self.sampler
            .subscribe(Subscription::Trace { max_lines_per_poll });
        SubscribeTraceResponse {
            subscribed: true,
            subscription_id: FeedKind::Trace.to_string(),
            max_lines_per_poll,
        }
    }

    pub fn subscribe_events(&self) -> SubscribeEventsResponse {
        self.sampler.subscribe(Subscription::Events);
        SubscribeEventsResponse {
            subscribed: true,
            subscription_id: FeedKind::Events.to_string(),
        }
    }

    /// Add a memory watch. `length` defaults to 1 and is clamped to 1..=256.
    pub fn subscribe_memory(
        &self,
        region: &str,
        address: u32,
        length: Option<usize>,
    ) -> SubscribeMemoryResponse {
        let length = length
            .unwrap_or(DEFAULT_WATCH_LENGTH)
            .clamp(1, MAX_WATCH_LENGTH);
        let watch = MemoryWatch::new(region, address, length);
        let subscription_id = watch.subscription_id();
        self.sampler.subscribe(Subscription::Memory(watch));
        SubscribeMemoryResponse {
            subscribed: true,
            subscription_id,
            region: region.to_string(),
            address,
            length,
        }
    }

    /// Remove every memory watch at `address`.
    pub fn unsubscribe_memory(&self, address: u32) -> UnsubscribeMemoryResponse {
        let removed = self.sampler.unsubscribe(Unsubscribe::MemoryAddress(address));
        UnsubscribeMemoryResponse {
            unsubscribed: true,
            address,
            removed,
        }
    }

    /// Drain up to `max_count` changes (default 100, clamped to 1000).
    pub fn get_changes(&self, max_count: Option<usize>) -> GetChangesResponse {
        let max_count = max_count
            .unwrap_or(DEFAULT_MAX_CHANGES)
            .min(MAX_CHANGES_PER_CALL);
        let changes = self.sampler.get_changes(max_count);
        GetChangesResponse {
            change_count: changes.len(),
            changes,
        }
    }

    pub fn get_streaming_status(&self) -> StreamingStatusResponse {
        StreamingStatusResponse {
            streaming: self.sampler.is_running(),
            stats: self.sampler.get_stats(),
        }
    }

    /// Generic subscribe keyed by a `kind` string.
    fn subscribe_kind(&self, params: &Value) -> Result<Value> {
        let KindParams { kind } = parse_params(params)?;
        match kind.parse::<FeedKind>()? {
            FeedKind::Trace => {
                let p: TraceParams = parse_params(params)?;
                to_value(self.subscribe_trace(p.max_lines_per_poll))
            }
            FeedKind::Events => to_value(self.subscribe_events()),
            FeedKind::Memory => {
                let p: MemoryParams = parse_params(params)?;
                to_value(self.subscribe_memory(&p.region, p.address, p.length))
            }
        }
    }

    /// Generic unsubscribe keyed by a `kind` string.
    ///
    /// For memory, giving `region` and `length` alongside `address` removes
    /// only that exact watch; `address` alone removes all watches there.
    /// Giving just one of `region` or `length` is rejected.
    fn unsubscribe_kind(&self, params: &Value) -> Result<Value> {
        let KindParams { kind } = parse_params(params)?;
        let kind = kind.parse::<FeedKind>()?;
        match kind {
            FeedKind::Trace | FeedKind::Events => {
                let target = if kind == FeedKind::Trace {
                    Unsubscribe::Trace
                } else {
                    Unsubscribe::Events
                };
                self.sampler.unsubscribe(target);
                to_value(UnsubscribeResponse {
                    unsubscribed: true,
                    subscription_id: kind.to_string(),
                })
            }
            FeedKind::Memory => {
                let p: AddressParams = parse_params(params)?;
                match (p.region, p.length) {
                    (Some(region), Some(length)) => {
                        let length = length.clamp(1, MAX_WATCH_LENGTH);
                        let watch = MemoryWatch::new(region, p.address, length);
                        let removed = self.sampler.unsubscribe(Unsubscribe::MemoryWatch(watch));
                        to_value(UnsubscribeMemoryResponse {
                            unsubscribed: true,
                            address: p.address,
                            removed,
                        })
                    }
                    (None, None) => to_value(self.unsubscribe_memory(p.address)),
                    _ => Err(StreamError::InvalidParams(
                        "exact memory unsubscribe needs both region and length".into(),
                    )),
                }
            }
        }
    }

    /// Route a named operation with JSON parameters to its handler.
    pub fn call(&self, operation: &str, params: &Value) -> Result<Value> {
        match operation {
            "start_streaming" => to_value(self.start_streaming()?),
            "stop_streaming" => to_value(self.stop_streaming()),
            "subscribe_trace" => {
                let p: TraceParams = parse_params(params)?;
                to_value(self.subscribe_trace(p.max_lines_per_poll))
            }
            "subscribe_events" => to_value(self.subscribe_events()),
            "subscribe_memory" => {
                let p: MemoryParams = parse_params(params)?;
                to_value(self.subscribe_memory(&p.region, p.address, p.length))
            }
            "unsubscribe_memory" => {
                let p: AddressParams = parse_params(params)?;
                to_value(self.unsubscribe_memory(p.address))
            }
            "get_changes" => {
                let p: ChangesParams = parse_params(params)?;
                to_value(self.get_changes(p.max_count))
            }
            "get_streaming_status" => to_value(self.get_streaming_status()),
            "subscribe" => self.subscribe_kind(params),
            "unsubscribe" => self.unsubscribe_kind(params),
            other => Err(StreamError::UnknownOperation(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryTarget;
    use serde_json::json;

    fn service() -> StreamingService {
        StreamingService::new(Arc::new(MemoryTarget::new()), SamplerConfig::default()).unwrap()
    }

    #[test]
    fn test_memory_length_clamped() {
        let service = service();
        let response = service.subscribe_memory("R", 100, Some(500));
        assert!(response.subscribed);
        assert_eq!(response.length, 256);
        assert_eq!(response.subscription_id, "memory_R_100_256");
        assert_eq!(service.sampler().subscriptions().memory_watches[0].length, 256);
    }

    #[test]
    fn test_defaults_applied() {
        let service = service();
        assert_eq!(service.subscribe_trace(None).max_lines_per_poll, 100);
        assert_eq!(service.subscribe_memory("wram", 0, None).length, 1);
    }

    #[test]
    fn test_call_routes_by_name() {
        let service = service();
        let result = service
            .call("subscribe_trace", &json!({"max_lines_per_poll": 5000}))
            .unwrap();
        assert_eq!(result["subscription_id"], "trace");
        assert_eq!(result["max_lines_per_poll"], 1000);

        let result = service.call("get_changes", &Value::Null).unwrap();
        assert_eq!(result["change_count"], 0);
    }

    #[test]
    fn test_call_rejects_unknown_kind_and_operation() {
        let service = service();
        let err = service
            .call("subscribe", &json!({"kind": "registers"}))
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidSubscriptionKind(_)));

        let err = service.call("rewind", &Value::Null).unwrap_err();
        assert!(matches!(err, StreamError::UnknownOperation(_)));

        let err = service
            .call("subscribe_memory", &json!({"address": 16}))
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidParams(_)));
    }

    #[test]
    fn test_generic_unsubscribe_exact_memory() {
        let service = service();
        service.subscribe_memory("wram", 16, Some(4));
        service.subscribe_memory("wram", 16, Some(8));

        let result = service
            .call(
                "unsubscribe",
                &json!({"kind": "memory", "address": 16, "region": "wram", "length": 4}),
            )
            .unwrap();
        assert_eq!(result["removed"], 1);

        let result = service
            .call("unsubscribe", &json!({"kind": "memory", "address": 16}))
            .unwrap();
        assert_eq!(result["removed"], 1);
        assert!(service.sampler().subscriptions().is_empty());
    }

    #[test]
    fn test_half_specified_memory_unsubscribe_rejected() {
        let service = service();
        service.subscribe_memory("wram", 16, Some(4));
        service.subscribe_memory("vram", 16, Some(4));

        let err = service
            .call("unsubscribe", &json!({"kind": "memory", "address": 16, "region": "wram"}))
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidParams(_)));

        let err = service
            .call("unsubscribe", &json!({"kind": "memory", "address": 16, "length": 4}))
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidParams(_)));

        // Nothing was removed by the rejected calls.
        assert_eq!(service.sampler().subscriptions().memory_watches.len(), 2);
    }
}
