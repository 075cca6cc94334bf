//! SLO metrics collector.
//!
//! Workers feed terminal outcomes in as they happen; `collect` combines
//! those counters with store-reported depths into a `MetricSnapshot`,
//! evaluates the SLO targets, emits metric/alert events, and appends the
//! snapshot to a bounded in-memory history.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tillsync_domain::{
    AlertEvent, AlertKind, DeadLetterReason, ErrorCategory, MetricEvent, MetricSnapshot,
    MetricsConfig, OperationOutcome, OutcomeReport, ProcessingState, QueueAgeReport,
    QueueDepthReport, Result, RetryReport, SloConfig, SloConfigUpdate, SloReport, SyncOperation,
    ThroughputReport,
};
use tracing::debug;

use crate::sync::circuit_breaker::{CircuitBreaker, Clock, SystemClock};
use crate::sync::ports::{DeadLetterStore, EventSink, QueueStore};

const THROUGHPUT_WINDOW_MS: i64 = 60_000;

const ALERT_QUEUE_DEPTH: &str = "queue_depth_target";
const ALERT_ERROR_RATE: &str = "error_rate_target";

#[derive(Debug, Default)]
struct OutcomeCounters {
    succeeded: AtomicU64,
    dead_lettered: AtomicU64,
    exhausted: AtomicU64,
}

/// Aggregates outcomes and produces periodic SLO snapshots.
pub struct MetricsCollector {
    store_id: String,
    config: MetricsConfig,
    slo: RwLock<SloConfig>,
    counters: OutcomeCounters,
    by_operation: Mutex<HashMap<String, OperationOutcome>>,
    failures_by_category: Mutex<HashMap<String, u64>>,
    /// Epoch-ms completion times inside the trailing throughput window.
    completions: Mutex<VecDeque<i64>>,
    peak_per_minute: AtomicU64,
    history: Mutex<VecDeque<MetricSnapshot>>,
    alerts_active: Mutex<HashMap<&'static str, bool>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl MetricsCollector {
    pub fn new(
        store_id: impl Into<String>,
        slo: SloConfig,
        config: MetricsConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_clock(store_id, slo, config, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store_id: impl Into<String>,
        slo: SloConfig,
        config: MetricsConfig,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            config,
            slo: RwLock::new(slo),
            counters: OutcomeCounters::default(),
            by_operation: Mutex::new(HashMap::new()),
            failures_by_category: Mutex::new(HashMap::new()),
            completions: Mutex::new(VecDeque::new()),
            peak_per_minute: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
            alerts_active: Mutex::new(HashMap::new()),
            sink,
            clock,
        }
    }

    /// Record a delivered item.
    pub fn record_success(&self, operation: SyncOperation) {
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        self.by_operation.lock().entry(operation.to_string()).or_default().succeeded += 1;
        self.record_completion();
    }

    /// Record a failed attempt that was rescheduled for retry.
    pub fn record_retry_scheduled(&self, category: ErrorCategory) {
        *self.failures_by_category.lock().entry(category.to_string()).or_default() += 1;
    }

    /// Record an item moved to the dead-letter store.
    pub fn record_dead_letter(
        &self,
        operation: SyncOperation,
        category: ErrorCategory,
        reason: DeadLetterReason,
    ) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if reason == DeadLetterReason::MaxAttemptsExceeded {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        }
        *self.failures_by_category.lock().entry(category.to_string()).or_default() += 1;
        self.by_operation.lock().entry(operation.to_string()).or_default().dead_lettered += 1;
        self.record_completion();
    }

    /// Current SLO targets.
    pub fn slo_config(&self) -> SloConfig {
        *self.slo.read()
    }

    /// Apply a partial SLO override; takes effect on the next collection.
    pub fn update_slo_config(&self, update: &SloConfigUpdate) -> SloConfig {
        let mut slo = self.slo.write();
        slo.apply(update);
        *slo
    }

    /// Most recent snapshot, if any collection has run.
    pub fn latest(&self) -> Option<MetricSnapshot> {
        self.history.lock().back().cloned()
    }

    /// Retained snapshots, oldest first.
    pub fn history(&self) -> Vec<MetricSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Clear counters and history. SLO config is preserved.
    pub fn reset(&self) {
        self.counters.succeeded.store(0, Ordering::Relaxed);
        self.counters.dead_lettered.store(0, Ordering::Relaxed);
        self.counters.exhausted.store(0, Ordering::Relaxed);
        self.by_operation.lock().clear();
        self.failures_by_category.lock().clear();
        self.completions.lock().clear();
        self.peak_per_minute.store(0, Ordering::Relaxed);
        self.history.lock().clear();
        self.alerts_active.lock().clear();
    }

    /// Run one collection cycle against the stores.
    pub async fn collect(
        &self,
        queue: &dyn QueueStore,
        dead_letters: &dyn DeadLetterStore,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<MetricSnapshot> {
        let now = self.clock.now_ms();
        let stats = queue.stats().await?;
        let dead_letter_count = dead_letters.count().await?;
        let oldest_pending_ms = queue.oldest_pending_age_ms().await?;

        let queue_depth = QueueDepthReport {
            pending: stats.pending,
            syncing: stats.syncing,
            backoff: stats.backoff,
            dead_letter: dead_letter_count,
            by_entity_type: stats.by_entity_type,
            by_operation: stats.by_operation,
        };

        // Age distribution estimated from the oldest eligible item; a full
        // per-item scan is not worth the read amplification at this cadence.
        let queue_age = QueueAgeReport {
            oldest_pending_ms,
            average_pending_ms: oldest_pending_ms.map(|ms| ms / 2),
            p95_pending_ms: oldest_pending_ms.map(|ms| ms / 10 * 9),
        };

        let retries = RetryReport {
            exhausted_total: self.counters.exhausted.load(Ordering::Relaxed),
            failures_by_category: self.failures_by_category.lock().clone(),
        };

        let succeeded = self.counters.succeeded.load(Ordering::Relaxed);
        let dead_lettered = self.counters.dead_lettered.load(Ordering::Relaxed);
        let completed = succeeded + dead_lettered;
        let success_rate =
            if completed == 0 { 1.0 } else { succeeded as f64 / completed as f64 };
        let outcomes = OutcomeReport {
            succeeded,
            dead_lettered,
            success_rate,
            by_operation: self.by_operation.lock().clone(),
        };

        let slo_config = *self.slo.read();
        let items_per_minute = self.current_throughput(now);
        let peak = self.peak_per_minute.fetch_max(items_per_minute, Ordering::Relaxed);
        let live_total = queue_depth.live_total();
        let processing_state = if live_total > slo_config.queue_depth_target {
            ProcessingState::Backpressure
        } else if live_total > 0 || items_per_minute > 0 {
            ProcessingState::Active
        } else {
            ProcessingState::Idle
        };
        let throughput = ThroughputReport {
            items_per_minute,
            peak_items_per_minute: peak.max(items_per_minute),
            processing_state,
        };

        let queue_depth_target_met = live_total <= slo_config.queue_depth_target;
        let error_rate_target_met = (1.0 - success_rate) <= slo_config.error_rate_target;
        let overall_compliant = queue_depth_target_met && error_rate_target_met;
        let compliance_24h = {
            let history = self.history.lock();
            let compliant =
                history.iter().filter(|snap| snap.slo.overall_compliant).count() as f64;
            let total = history.len() as f64 + 1.0;
            (compliant + if overall_compliant { 1.0 } else { 0.0 }) / total
        };
        let slo = SloReport {
            queue_depth_target_met,
            error_rate_target_met,
            overall_compliant,
            compliance_24h,
        };

        let snapshot = MetricSnapshot {
            collected_at: now,
            queue_depth,
            queue_age,
            retries,
            outcomes,
            throughput,
            slo,
            circuit_breaker: breaker.map(CircuitBreaker::snapshot),
        };

        self.emit_metrics(&snapshot);
        self.evaluate_alerts(&snapshot, now);

        let mut history = self.history.lock();
        if history.len() >= self.config.history_cap {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        debug!(
            target: "tillsync::metrics",
            pending = snapshot.queue_depth.pending,
            state = %snapshot.throughput.processing_state,
            compliant = snapshot.slo.overall_compliant,
            "metrics collected"
        );
        Ok(snapshot)
    }

    fn record_completion(&self) {
        let now = self.clock.now_ms();
        let mut completions = self.completions.lock();
        completions.push_back(now);
        Self::prune_completions(&mut completions, now);
    }

    fn current_throughput(&self, now: i64) -> u64 {
        let mut completions = self.completions.lock();
        Self::prune_completions(&mut completions, now);
        completions.len() as u64
    }

    fn prune_completions(completions: &mut VecDeque<i64>, now: i64) {
        let cutoff = now - THROUGHPUT_WINDOW_MS;
        while completions.front().is_some_and(|&ts| ts <= cutoff) {
            completions.pop_front();
        }
    }

    fn emit_metrics(&self, snapshot: &MetricSnapshot) {
        let gauges = [
            ("queue.depth.pending", snapshot.queue_depth.pending as f64, "items"),
            ("queue.depth.backoff", snapshot.queue_depth.backoff as f64, "items"),
            ("queue.depth.dead_letter", snapshot.queue_depth.dead_letter as f64, "items"),
            ("sync.success_rate", snapshot.outcomes.success_rate, "ratio"),
            ("sync.throughput", snapshot.throughput.items_per_minute as f64, "items_per_minute"),
        ];
        for (name, value, unit) in gauges {
            self.sink.record_metric(
                &MetricEvent::new(name, value, unit).with_tag("store_id", self.store_id.clone()),
            );
        }
    }

    /// Emit alert events on SLO target edges only, not on every breach tick.
    fn evaluate_alerts(&self, snapshot: &MetricSnapshot, now: i64) {
        let checks: [(&'static str, bool, String); 2] = [
            (
                ALERT_QUEUE_DEPTH,
                !snapshot.slo.queue_depth_target_met,
                format!(
                    "live queue depth {} exceeds target {}",
                    snapshot.queue_depth.live_total(),
                    self.slo.read().queue_depth_target
                ),
            ),
            (
                ALERT_ERROR_RATE,
                !snapshot.slo.error_rate_target_met,
                format!(
                    "success rate {:.3} below tolerated error rate {:.3}",
                    snapshot.outcomes.success_rate,
                    self.slo.read().error_rate_target
                ),
            ),
        ];
        let mut active = self.alerts_active.lock();
        for (name, breached, message) in checks {
            let was_active = active.get(name).copied().unwrap_or(false);
            if breached && !was_active {
                active.insert(name, true);
                self.sink.record_alert(&AlertEvent {
                    name: name.to_string(),
                    kind: AlertKind::Triggered,
                    message,
                    at: now,
                });
            } else if !breached && was_active {
                active.insert(name, false);
                self.sink.record_alert(&AlertEvent {
                    name: name.to_string(),
                    kind: AlertKind::Resolved,
                    message: format!("{name} back within target"),
                    at: now,
                });
            }
        }
    }
}
