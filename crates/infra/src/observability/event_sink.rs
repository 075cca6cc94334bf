//! Event sink that emits metrics and alerts as structured log lines.

use tillsync_domain::{AlertEvent, AlertKind, MetricEvent};
use tracing::{info, warn};

use tillsync_core::sync::ports::EventSink;

/// Sink that writes every event through `tracing`, one line per event, in a
/// greppable `metric_name=... value=...` form.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record_metric(&self, event: &MetricEvent) {
        info!(
            target: "tillsync::metrics",
            metric_name = %event.name,
            value = event.value,
            unit = %event.unit,
            tags = ?event.tags,
            "metric"
        );
    }

    fn record_alert(&self, event: &AlertEvent) {
        match event.kind {
            AlertKind::Triggered => warn!(
                target: "tillsync::alerts",
                alert = %event.name,
                message = %event.message,
                "alert triggered"
            ),
            AlertKind::Resolved => info!(
                target: "tillsync::alerts",
                alert = %event.name,
                message = %event.message,
                "alert resolved"
            ),
        }
    }
}
