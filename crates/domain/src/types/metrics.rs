//! Metric snapshot, SLO report, and observability event types.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::breaker::CircuitBreakerSnapshot;

/// Queue depth figures at collection time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueDepthReport {
    pub pending: u64,
    pub syncing: u64,
    pub backoff: u64,
    pub dead_letter: u64,
    pub by_entity_type: HashMap<String, u64>,
    pub by_operation: HashMap<String, u64>,
}

impl QueueDepthReport {
    /// Live items counted against the depth SLO target.
    pub fn live_total(&self) -> u64 {
        self.pending + self.syncing + self.backoff
    }
}

/// Age of dispatch-eligible work, in milliseconds.
///
/// Average and p95 are estimated from the oldest item age rather than a full
/// scan; good enough for alerting, cheap enough to collect every tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueAgeReport {
    pub oldest_pending_ms: Option<u64>,
    pub average_pending_ms: Option<u64>,
    pub p95_pending_ms: Option<u64>,
}

/// Retry pressure since the last reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryReport {
    /// Items that exhausted their attempt ceiling and were dead-lettered.
    pub exhausted_total: u64,
    pub failures_by_category: HashMap<String, u64>,
}

/// Terminal outcomes since the last reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub succeeded: u64,
    pub dead_lettered: u64,
    /// `succeeded / (succeeded + dead_lettered)`; 1.0 when nothing has
    /// completed yet.
    pub success_rate: f64,
    pub by_operation: HashMap<String, OperationOutcome>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub succeeded: u64,
    pub dead_lettered: u64,
}

/// Dispatcher activity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// No eligible work.
    Idle,
    /// Work is flowing and depth is within target.
    Active,
    /// Live depth exceeds the configured SLO target.
    Backpressure,
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingState::Idle => write!(f, "idle"),
            ProcessingState::Active => write!(f, "active"),
            ProcessingState::Backpressure => write!(f, "backpressure"),
        }
    }
}

/// Completion throughput over the trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputReport {
    pub items_per_minute: u64,
    /// Highest per-minute rate observed since the last reset.
    pub peak_items_per_minute: u64,
    pub processing_state: ProcessingState,
}

impl Default for ThroughputReport {
    fn default() -> Self {
        Self { items_per_minute: 0, peak_items_per_minute: 0, processing_state: ProcessingState::Idle }
    }
}

/// Evaluation of the configured service level objectives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SloReport {
    pub queue_depth_target_met: bool,
    pub error_rate_target_met: bool,
    pub overall_compliant: bool,
    /// Share of snapshots in the retained history (up to 24h) that were
    /// compliant, 0.0..=1.0.
    pub compliance_24h: f64,
}

/// One full collection cycle's output. `collected_at` is epoch milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub collected_at: i64,
    pub queue_depth: QueueDepthReport,
    pub queue_age: QueueAgeReport,
    pub retries: RetryReport,
    pub outcomes: OutcomeReport,
    pub throughput: ThroughputReport,
    pub slo: SloReport,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
}

/// A single named measurement emitted to the event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub tags: HashMap<String, String>,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self { name: name.into(), value, unit: unit.into(), tags: HashMap::new() }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Whether an alert condition began or cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Triggered,
    Resolved,
}

/// SLO breach notification emitted to the event sink. Timestamps are epoch
/// milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub name: String,
    pub kind: AlertKind,
    pub message: String,
    pub at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_total_excludes_dead_letters() {
        let depth = QueueDepthReport {
            pending: 10,
            syncing: 2,
            backoff: 3,
            dead_letter: 100,
            ..Default::default()
        };
        assert_eq!(depth.live_total(), 15);
    }

    #[test]
    fn default_throughput_is_idle() {
        let t = ThroughputReport::default();
        assert_eq!(t.processing_state, ProcessingState::Idle);
        assert_eq!(t.items_per_minute, 0);
    }

    #[test]
    fn metric_event_builder_accumulates_tags() {
        let event = MetricEvent::new("queue.depth.pending", 42.0, "items")
            .with_tag("store_id", "store-1");
        assert_eq!(event.tags.get("store_id").map(String::as_str), Some("store-1"));
    }

    #[test]
    fn snapshot_serializes_processing_state_lowercase() {
        let snap = MetricSnapshot::default();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["throughput"]["processing_state"], "idle");
    }
}
