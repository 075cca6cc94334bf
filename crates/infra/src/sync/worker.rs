//! Dispatch worker: runs the dispatcher on an interval and on demand.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tillsync_domain::DispatcherConfig;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tillsync_core::sync::circuit_breaker::CircuitBreaker;
use tillsync_core::sync::dispatcher::Dispatcher;
use tillsync_core::sync::ports::QueueStore;

use crate::errors::WorkerError;

const WORKER_NAME: &str = "sync_worker";

/// Drives the dispatcher: ticks every poll interval, immediately on
/// `trigger_sync`, and keeps ticking while full batches come back.
pub struct SyncWorker {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn QueueStore>,
    breaker: Arc<CircuitBreaker>,
    config: DispatcherConfig,
    sync_now: Arc<Notify>,
    running: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl SyncWorker {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        queue: Arc<dyn QueueStore>,
        breaker: Arc<CircuitBreaker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            breaker,
            config,
            sync_now: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    /// Spawn the dispatch loop.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|(handle, _)| !handle.is_finished()) {
            return Err(WorkerError::AlreadyRunning(WORKER_NAME));
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.queue),
            Arc::clone(&self.breaker),
            self.config.clone(),
            Arc::clone(&self.sync_now),
            token.clone(),
        ));
        *running = Some((handle, token));
        info!(target: "tillsync::worker", "sync worker started");
        Ok(())
    }

    /// Cancel the loop and wait for it to finish.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let Some((handle, token)) = self.running.lock().take() else {
            return Err(WorkerError::NotRunning(WORKER_NAME));
        };
        token.cancel();
        let join_timeout = Duration::from_secs(self.config.join_timeout_secs);
        if timeout(join_timeout, handle).await.is_err() {
            return Err(WorkerError::JoinTimeout {
                name: WORKER_NAME,
                timeout_secs: self.config.join_timeout_secs,
            });
        }
        info!(target: "tillsync::worker", "sync worker stopped");
        Ok(())
    }

    /// Wake the loop for an immediate tick.
    pub fn trigger_sync(&self) {
        self.sync_now.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|(handle, _)| !handle.is_finished())
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if let Some((_, token)) = self.running.lock().take() {
            token.cancel();
        }
    }
}

async fn dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn QueueStore>,
    breaker: Arc<CircuitBreaker>,
    config: DispatcherConfig,
    sync_now: Arc<Notify>,
    token: CancellationToken,
) {
    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let tick_timeout = Duration::from_secs(config.tick_timeout_secs);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = sync_now.notified() => {}
            () = sleep(poll_interval) => {}
        }

        // Drain: keep ticking while full batches come back.
        loop {
            if token.is_cancelled() {
                return;
            }
            let claimed = match timeout(tick_timeout, dispatcher.tick(config.batch_size)).await {
                Ok(Ok(report)) => {
                    if !report.is_empty() {
                        debug!(
                            target: "tillsync::worker",
                            claimed = report.claimed,
                            succeeded = report.succeeded,
                            retried = report.retried,
                            dead_lettered = report.dead_lettered,
                            released = report.released,
                            "dispatch tick complete"
                        );
                    }
                    report.claimed
                }
                Ok(Err(err)) => {
                    warn!(target: "tillsync::worker", error = %err, "dispatch tick failed");
                    0
                }
                Err(_) => {
                    warn!(
                        target: "tillsync::worker",
                        timeout_secs = config.tick_timeout_secs,
                        "dispatch tick timed out"
                    );
                    0
                }
            };

            // Breaker state survives restarts; a save failure only costs
            // recovery fidelity, never the loop.
            if let Err(err) = queue.save_breaker_snapshot(&breaker.snapshot()).await {
                warn!(target: "tillsync::worker", error = %err, "failed to persist breaker state");
            }

            if claimed < config.batch_size {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tillsync_core::sync::metrics::MetricsCollector;
    use tillsync_core::sync::ports::{NullEventSink, RemoteSendClient, SendFailure};
    use tillsync_core::sync::retry::RetryPolicy;
    use tillsync_domain::{
        BreakerConfig, MetricsConfig, QueueItem, RetryConfig, SloConfig, SyncDirection,
        SyncOperation,
    };
    use tempfile::TempDir;

    use crate::database::manager::open_database;
    use crate::database::queue_repository::SqliteQueueStore;

    use super::*;

    struct AlwaysOk;

    #[async_trait]
    impl RemoteSendClient for AlwaysOk {
        async fn send(&self, _item: &QueueItem) -> Result<(), SendFailure> {
            Ok(())
        }
    }

    fn worker(dir: &TempDir) -> (SyncWorker, Arc<SqliteQueueStore>) {
        let db = open_database(dir.path().join("test.db"), 4).expect("db opened");
        let queue = Arc::new(SqliteQueueStore::new(
            db,
            "store-1",
            RetryPolicy::new(RetryConfig::default()),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let metrics = Arc::new(MetricsCollector::new(
            "store-1",
            SloConfig::default(),
            MetricsConfig::default(),
            Arc::new(NullEventSink),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone() as Arc<dyn QueueStore>,
            Arc::new(AlwaysOk),
            Arc::clone(&breaker),
            metrics,
        ));
        let config = DispatcherConfig { poll_interval_secs: 3_600, ..DispatcherConfig::default() };
        let worker =
            SyncWorker::new(dispatcher, queue.clone() as Arc<dyn QueueStore>, breaker, config);
        (worker, queue)
    }

    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let dir = TempDir::new().expect("temp dir");
        let (worker, _queue) = worker(&dir);
        worker.start().expect("first start");
        assert_eq!(worker.start(), Err(WorkerError::AlreadyRunning(WORKER_NAME)));
        worker.stop().await.expect("stopped");
    }

    #[tokio::test]
    async fn stop_without_start_reports_not_running() {
        let dir = TempDir::new().expect("temp dir");
        let (worker, _queue) = worker(&dir);
        assert_eq!(worker.stop().await, Err(WorkerError::NotRunning(WORKER_NAME)));
    }

    #[tokio::test]
    async fn lifecycle_flags_running_state() {
        let dir = TempDir::new().expect("temp dir");
        let (worker, _queue) = worker(&dir);
        assert!(!worker.is_running());
        worker.start().expect("started");
        assert!(worker.is_running());
        worker.stop().await.expect("stopped");
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn trigger_sync_drains_the_queue() {
        let dir = TempDir::new().expect("temp dir");
        let (worker, queue) = worker(&dir);
        let item = QueueItem::new(
            "store-1",
            "sale",
            "sale-1",
            SyncOperation::Create,
            SyncDirection::Push,
            "{}",
        );
        queue.enqueue(item).await.expect("enqueued");

        worker.start().expect("started");
        worker.trigger_sync();

        let mut drained = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if queue.pending_count().await.expect("count") == 0 {
                drained = true;
                break;
            }
        }
        worker.stop().await.expect("stopped");
        assert!(drained, "queue was not drained after trigger_sync");
    }
}
