//! Metrics worker: runs the collector on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tillsync_domain::MetricsConfig;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tillsync_core::sync::circuit_breaker::CircuitBreaker;
use tillsync_core::sync::metrics::MetricsCollector;
use tillsync_core::sync::ports::{DeadLetterStore, QueueStore};

use crate::errors::WorkerError;

const WORKER_NAME: &str = "metrics_worker";
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically collects a metric snapshot from the stores.
pub struct MetricsWorker {
    collector: Arc<MetricsCollector>,
    queue: Arc<dyn QueueStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    breaker: Arc<CircuitBreaker>,
    config: MetricsConfig,
    running: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl MetricsWorker {
    pub fn new(
        collector: Arc<MetricsCollector>,
        queue: Arc<dyn QueueStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        breaker: Arc<CircuitBreaker>,
        config: MetricsConfig,
    ) -> Self {
        Self {
            collector,
            queue,
            dead_letters,
            breaker,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|(handle, _)| !handle.is_finished()) {
            return Err(WorkerError::AlreadyRunning(WORKER_NAME));
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(collection_loop(
            Arc::clone(&self.collector),
            Arc::clone(&self.queue),
            Arc::clone(&self.dead_letters),
            Arc::clone(&self.breaker),
            self.config,
            token.clone(),
        ));
        *running = Some((handle, token));
        info!(target: "tillsync::worker", "metrics worker started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), WorkerError> {
        let Some((handle, token)) = self.running.lock().take() else {
            return Err(WorkerError::NotRunning(WORKER_NAME));
        };
        token.cancel();
        if timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
            return Err(WorkerError::JoinTimeout {
                name: WORKER_NAME,
                timeout_secs: STOP_JOIN_TIMEOUT.as_secs(),
            });
        }
        info!(target: "tillsync::worker", "metrics worker stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|(handle, _)| !handle.is_finished())
    }
}

impl Drop for MetricsWorker {
    fn drop(&mut self) {
        if let Some((_, token)) = self.running.lock().take() {
            token.cancel();
        }
    }
}

async fn collection_loop(
    collector: Arc<MetricsCollector>,
    queue: Arc<dyn QueueStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    breaker: Arc<CircuitBreaker>,
    config: MetricsConfig,
    token: CancellationToken,
) {
    let interval = Duration::from_secs(config.collection_interval_secs);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = sleep(interval) => {}
        }
        if let Err(err) =
            collector.collect(queue.as_ref(), dead_letters.as_ref(), Some(&breaker)).await
        {
            warn!(target: "tillsync::worker", error = %err, "metrics collection failed");
        }
    }
}
