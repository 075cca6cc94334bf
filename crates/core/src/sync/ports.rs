//! Port interfaces for the sync engine
//!
//! Storage, transport, and observability are reached exclusively through
//! these traits; adapters live in `tillsync-infra`.

use async_trait::async_trait;
use tillsync_domain::{
    AlertEvent, CircuitBreakerSnapshot, DeadLetterEntry, DeadLetterReason, DeadLetterStats,
    ErrorCategory, MetricEvent, QueueItem, QueueStats, Result,
};

/// What the store did with a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Item was rescheduled; eligible again at the given epoch-ms deadline.
    Scheduled { next_attempt_at: i64 },
    /// Item was moved to the dead-letter store.
    DeadLettered { reason: DeadLetterReason },
}

/// Trait for the durable outbound queue.
///
/// Implementations must make `claim_batch` exclusive: an item claimed by one
/// caller is invisible to concurrent claims until released or resolved.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new item. Returns the stored item's id, which may be an
    /// existing id when the write coalesced with a still-pending item for
    /// the same entity and operation.
    async fn enqueue(&self, item: QueueItem) -> Result<String>;

    /// Atomically claim up to `limit` dispatch-eligible items, oldest first,
    /// holding back items whose entity has an earlier unresolved item.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueItem>>;

    /// Resolve a claimed item as delivered.
    async fn mark_succeeded(&self, item_id: &str) -> Result<()>;

    /// Record a failed attempt; the store applies the retry policy and
    /// either reschedules the item or moves it to the dead-letter store.
    async fn mark_failed(
        &self,
        item_id: &str,
        category: ErrorCategory,
        error: &str,
    ) -> Result<FailureOutcome>;

    /// Return a claimed item to the eligible pool without counting an
    /// attempt (e.g. when the breaker opened mid-batch).
    async fn release_claim(&self, item_id: &str) -> Result<()>;

    /// Items eligible for dispatch right now.
    async fn pending_count(&self) -> Result<u64>;

    /// Failed items waiting out a retry delay.
    async fn backoff_count(&self) -> Result<u64>;

    /// Full live-queue breakdown.
    async fn stats(&self) -> Result<QueueStats>;

    /// Age in milliseconds of the oldest dispatch-eligible item.
    async fn oldest_pending_age_ms(&self) -> Result<Option<u64>>;

    /// Load the persisted breaker snapshot, if one was saved.
    async fn load_breaker_snapshot(&self) -> Result<Option<CircuitBreakerSnapshot>>;

    /// Persist the breaker snapshot for restart recovery.
    async fn save_breaker_snapshot(&self, snapshot: &CircuitBreakerSnapshot) -> Result<()>;
}

/// Trait for the dead-letter store.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// List entries, newest failures first.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Fetch a single entry.
    async fn get(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>>;

    /// Total entries retained.
    async fn count(&self) -> Result<u64>;

    /// Aggregate breakdown by reason, entity type, and error category.
    async fn stats(&self) -> Result<DeadLetterStats>;

    /// Re-queue one entry as a fresh pending item with a reset attempt
    /// count. Returns the new queue item id.
    async fn replay(&self, entry_id: &str) -> Result<String>;

    /// Re-queue up to `limit` entries, oldest failures first. Returns the
    /// number replayed.
    async fn replay_batch(&self, limit: usize) -> Result<u64>;

    /// Drop a single entry without replaying it.
    async fn delete(&self, entry_id: &str) -> Result<()>;

    /// Drop entries whose `failed_at` is before the epoch-ms cutoff.
    /// Returns the number removed.
    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64>;
}

/// A failed delivery attempt, classified for the retry policy.
#[derive(Debug, Clone)]
pub struct SendFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl SendFailure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self { category, message: message.into() }
    }
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// Trait for delivering a queue item to the remote service.
#[async_trait]
pub trait RemoteSendClient: Send + Sync {
    /// Attempt delivery of one item. `Ok(())` means the remote accepted it.
    async fn send(&self, item: &QueueItem) -> std::result::Result<(), SendFailure>;
}

/// Trait for receiving metric and alert events.
///
/// Synchronous on purpose: sinks are expected to be cheap (log lines,
/// counters), never blocking I/O.
pub trait EventSink: Send + Sync {
    fn record_metric(&self, event: &MetricEvent);
    fn record_alert(&self, event: &AlertEvent);
}

/// Sink that drops everything; used where observability is not wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record_metric(&self, _event: &MetricEvent) {}
    fn record_alert(&self, _event: &AlertEvent) {}
}
