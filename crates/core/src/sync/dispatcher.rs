//! Dispatcher: drains the queue one claimed batch at a time.

use std::sync::Arc;

use tillsync_domain::{ErrorCategory, Result};
use tracing::{debug, instrument, warn};

use crate::sync::circuit_breaker::CircuitBreaker;
use crate::sync::metrics::MetricsCollector;
use crate::sync::ports::{FailureOutcome, QueueStore, RemoteSendClient};

/// Longest error text persisted per item.
const MAX_ERROR_LEN: usize = 256;

/// Outcome counts for one dispatch tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Claims returned untouched because the breaker refused execution.
    pub released: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Claims eligible items, sends them through the remote client, and records
/// each outcome. A rejected send never blocks the rest of the batch, but a
/// storage failure aborts the tick.
pub struct Dispatcher {
    queue: Arc<dyn QueueStore>,
    client: Arc<dyn RemoteSendClient>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsCollector>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        client: Arc<dyn RemoteSendClient>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { queue, client, breaker, metrics }
    }

    /// Run one claim-send-resolve cycle over at most `batch_size` items.
    #[instrument(skip(self))]
    pub async fn tick(&self, batch_size: usize) -> Result<TickReport> {
        let batch = self.queue.claim_batch(batch_size).await?;
        let mut report = TickReport { claimed: batch.len(), ..TickReport::default() };
        if batch.is_empty() {
            return Ok(report);
        }
        debug!(target: "tillsync::dispatch", claimed = batch.len(), "dispatching batch");

        for item in batch {
            if !self.breaker.can_execute() {
                // Return the claim without burning an attempt; the item
                // becomes eligible again once the breaker admits traffic.
                self.queue.release_claim(&item.id).await?;
                report.released += 1;
                continue;
            }

            match self.client.send(&item).await {
                Ok(()) => {
                    self.breaker.record_success();
                    // Storage errors here are fatal: the item was delivered
                    // but stays claimed, and the stuck-claim reclaim will
                    // make it eligible again for an at-least-once redelivery.
                    self.queue.mark_succeeded(&item.id).await?;
                    self.metrics.record_success(item.operation);
                    report.succeeded += 1;
                }
                Err(failure) => {
                    // Application-level rejections say nothing about remote
                    // health; only infrastructure failures feed the breaker.
                    if matches!(
                        failure.category,
                        ErrorCategory::Transient | ErrorCategory::Unknown
                    ) {
                        self.breaker.record_failure();
                    } else {
                        self.breaker.record_success();
                    }
                    let message = truncate_error(&failure.message);
                    match self.queue.mark_failed(&item.id, failure.category, &message).await? {
                        FailureOutcome::Scheduled { next_attempt_at } => {
                            self.metrics.record_retry_scheduled(failure.category);
                            report.retried += 1;
                            debug!(
                                target: "tillsync::dispatch",
                                item_id = %item.id,
                                category = %failure.category,
                                next_attempt_at,
                                "attempt failed, retry scheduled"
                            );
                        }
                        FailureOutcome::DeadLettered { reason } => {
                            self.metrics.record_dead_letter(
                                item.operation,
                                failure.category,
                                reason,
                            );
                            report.dead_lettered += 1;
                            warn!(
                                target: "tillsync::dispatch",
                                item_id = %item.id,
                                entity_type = %item.entity_type,
                                reason = %reason,
                                "item dead-lettered"
                            );
                        }
                    }
                }
            }
        }
        Ok(report)
    }
}

fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
