//! Engine composition root: wires stores, breaker, dispatcher, collector,
//! and workers together behind one handle.

use std::sync::Arc;

use tillsync_domain::{
    CircuitState, DeadLetterEntry, DeadLetterStats, MetricSnapshot, QueueItem, QueueStats,
    Result as DomainResult, SloConfig, SloConfigUpdate, SyncConfig, SyncDirection, SyncOperation,
};
use tracing::{info, warn};

use tillsync_core::sync::circuit_breaker::CircuitBreaker;
use tillsync_core::sync::dispatcher::Dispatcher;
use tillsync_core::sync::metrics::MetricsCollector;
use tillsync_core::sync::ports::{DeadLetterStore, EventSink, QueueStore};
use tillsync_core::sync::retry::RetryPolicy;

use crate::database::dead_letter_repository::SqliteDeadLetterStore;
use crate::database::manager::{open_database, DbManager};
use crate::database::queue_repository::SqliteQueueStore;
use crate::errors::WorkerError;
use crate::http::send_client::HttpSendClient;
use crate::observability::event_sink::TracingEventSink;
use crate::sync::metrics_worker::MetricsWorker;
use crate::sync::worker::SyncWorker;

const MS_PER_DAY: i64 = 86_400_000;

/// The assembled sync engine for one store.
///
/// Owns the database, both stores, the breaker, the metrics collector, and
/// the two background workers. Callers interact only through this handle.
pub struct SyncEngine {
    config: SyncConfig,
    db: Arc<DbManager>,
    queue: Arc<SqliteQueueStore>,
    dead_letters: Arc<SqliteDeadLetterStore>,
    breaker: Arc<CircuitBreaker>,
    collector: Arc<MetricsCollector>,
    worker: SyncWorker,
    metrics_worker: MetricsWorker,
}

impl SyncEngine {
    /// Build the engine: open the database, run migrations, and restore any
    /// persisted circuit breaker state. Workers are not started yet.
    pub async fn new(config: SyncConfig) -> DomainResult<Self> {
        config.validate()?;
        let db = open_database(&config.database.path, config.database.pool_size)?;
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let retry = RetryPolicy::new(config.retry.clone());
        let queue = Arc::new(
            SqliteQueueStore::new(Arc::clone(&db), &config.store_id, retry)
                .with_breaker(Arc::clone(&breaker))
                .with_stuck_claim_timeout_ms(
                    config.dispatcher.stuck_claim_timeout_secs as i64 * 1_000,
                ),
        );
        if let Some(snapshot) = queue.load_breaker_snapshot().await? {
            info!(
                target: "tillsync::engine",
                state = %snapshot.state,
                "restoring persisted circuit breaker state"
            );
            breaker.restore(&snapshot);
        }

        let dead_letters = Arc::new(SqliteDeadLetterStore::new(Arc::clone(&db), &config.store_id));
        let sink: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        let collector = Arc::new(MetricsCollector::new(
            &config.store_id,
            config.slo,
            config.metrics,
            sink,
        ));
        let client = Arc::new(HttpSendClient::new(&config.remote_url)?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            client,
            Arc::clone(&breaker),
            Arc::clone(&collector),
        ));
        let worker = SyncWorker::new(
            dispatcher,
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            Arc::clone(&breaker),
            config.dispatcher.clone(),
        );
        let metrics_worker = MetricsWorker::new(
            Arc::clone(&collector),
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            Arc::clone(&dead_letters) as Arc<dyn DeadLetterStore>,
            Arc::clone(&breaker),
            config.metrics,
        );

        Ok(Self { config, db, queue, dead_letters, breaker, collector, worker, metrics_worker })
    }

    /// Start both background workers.
    pub fn start(&self) -> Result<(), WorkerError> {
        self.worker.start()?;
        self.metrics_worker.start()?;
        info!(target: "tillsync::engine", store_id = %self.config.store_id, "sync engine running");
        Ok(())
    }

    /// Stop the workers and persist the breaker state.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        self.worker.stop().await?;
        self.metrics_worker.stop().await?;
        if let Err(err) = self.queue.save_breaker_snapshot(&self.breaker.snapshot()).await {
            warn!(target: "tillsync::engine", error = %err, "failed to persist breaker state");
        }
        info!(target: "tillsync::engine", "sync engine shut down");
        Ok(())
    }

    /// Queue a mutation for delivery. Returns the queue item id.
    pub async fn enqueue(&self, item: QueueItem) -> DomainResult<String> {
        self.queue.enqueue(item).await
    }

    /// Convenience constructor + enqueue for the common push case.
    pub async fn enqueue_push(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: SyncOperation,
        payload: impl Into<String>,
    ) -> DomainResult<String> {
        let item = QueueItem::new(
            &self.config.store_id,
            entity_type,
            entity_id,
            operation,
            SyncDirection::Push,
            payload,
        );
        self.enqueue(item).await
    }

    /// Wake the dispatch loop immediately instead of waiting for the poll
    /// interval.
    pub fn sync_now(&self) {
        self.worker.trigger_sync();
    }

    pub async fn queue_stats(&self) -> DomainResult<QueueStats> {
        self.queue.stats().await
    }

    pub async fn dead_letters(
        &self,
        limit: usize,
        offset: usize,
    ) -> DomainResult<Vec<DeadLetterEntry>> {
        self.dead_letters.list(limit, offset).await
    }

    pub async fn dead_letter_stats(&self) -> DomainResult<DeadLetterStats> {
        self.dead_letters.stats().await
    }

    /// Replay one dead-letter entry; returns the new queue item id.
    pub async fn replay_dead_letter(&self, entry_id: &str) -> DomainResult<String> {
        let new_id = self.dead_letters.replay(entry_id).await?;
        self.sync_now();
        Ok(new_id)
    }

    /// Replay up to `limit` entries, oldest first.
    pub async fn replay_dead_letters(&self, limit: usize) -> DomainResult<u64> {
        let replayed = self.dead_letters.replay_batch(limit).await?;
        if replayed > 0 {
            self.sync_now();
        }
        Ok(replayed)
    }

    /// Operator action: dead-letter one queue item with reason `manual`.
    pub async fn dead_letter_item(&self, item_id: &str, note: &str) -> DomainResult<()> {
        self.queue.dead_letter_manually(item_id, note).await
    }

    /// Drop dead-letter entries older than the given retention window.
    pub async fn purge_dead_letters(&self, retention_days: u32) -> DomainResult<u64> {
        let cutoff = chrono::Utc::now().timestamp_millis() - i64::from(retention_days) * MS_PER_DAY;
        self.dead_letters.purge_older_than(cutoff).await
    }

    /// Run a metrics collection cycle immediately.
    pub async fn collect_metrics_now(&self) -> DomainResult<MetricSnapshot> {
        self.collector
            .collect(self.queue.as_ref(), self.dead_letters.as_ref(), Some(&self.breaker))
            .await
    }

    /// Most recent snapshot, if any collection has run.
    pub fn latest_metrics(&self) -> Option<MetricSnapshot> {
        self.collector.latest()
    }

    /// Adjust SLO targets at runtime; returns the effective config.
    pub fn update_slo(&self, update: &SloConfigUpdate) -> SloConfig {
        self.collector.update_slo_config(update)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Operator escape hatch: force the breaker closed.
    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    pub fn health_check(&self) -> DomainResult<()> {
        self.db.health_check()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tillsync_domain::DatabaseConfig;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(dir: &TempDir, remote_url: String) -> SyncConfig {
        SyncConfig {
            store_id: "store-1".into(),
            remote_url,
            database: DatabaseConfig { path: dir.path().join("engine.db"), pool_size: 4 },
            dispatcher: tillsync_domain::DispatcherConfig {
                poll_interval_secs: 3_600,
                ..Default::default()
            },
            retry: Default::default(),
            breaker: Default::default(),
            slo: Default::default(),
            metrics: Default::default(),
        }
    }

    #[tokio::test]
    async fn end_to_end_delivery_drains_the_queue() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let dir = TempDir::new().expect("temp dir");
        let engine = SyncEngine::new(config(&dir, server.uri())).await.expect("engine built");
        engine
            .enqueue_push("sale", "sale-1", SyncOperation::Create, r#"{"total":10}"#)
            .await
            .expect("enqueued");

        engine.start().expect("started");
        engine.sync_now();

        let mut drained = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let stats = engine.queue_stats().await.expect("stats");
            if stats.total() == 0 {
                drained = true;
                break;
            }
        }
        engine.shutdown().await.expect("shut down");
        assert!(drained, "queue was not drained");

        let snapshot = engine.collect_metrics_now().await.expect("collected");
        assert_eq!(snapshot.outcomes.succeeded, 1);
        assert!((snapshot.outcomes.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn breaker_state_survives_engine_restart() {
        let dir = TempDir::new().expect("temp dir");
        let remote = "http://127.0.0.1:1".to_string();
        {
            let engine = SyncEngine::new(config(&dir, remote.clone())).await.expect("built");
            for _ in 0..engine.config().breaker.failure_threshold {
                // Feed failures directly; the remote is unreachable anyway.
                engine.breaker.record_failure();
            }
            assert_eq!(engine.circuit_state(), CircuitState::Open);
            engine
                .queue
                .save_breaker_snapshot(&engine.breaker.snapshot())
                .await
                .expect("saved");
        }
        let engine = SyncEngine::new(config(&dir, remote)).await.expect("rebuilt");
        assert_eq!(engine.circuit_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let mut cfg = config(&dir, "http://localhost".into());
        cfg.store_id = String::new();
        assert!(SyncEngine::new(cfg).await.is_err());
    }
}
