//! End-to-end queue behavior against a real SQLite database.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tillsync_core::sync::circuit_breaker::CircuitBreaker;
use tillsync_core::sync::ports::{FailureOutcome, QueueStore};
use tillsync_core::sync::retry::RetryPolicy;
use tillsync_domain::{
    BreakerConfig, DeadLetterReason, ErrorCategory, QueueItem, RetryConfig, SyncDirection,
    SyncOperation,
};
use tillsync_infra::database::manager::open_database;
use tillsync_infra::SqliteQueueStore;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        unknown_max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 2,
        jitter_factor: 0.0,
    }
}

fn store_with(dir: &TempDir, retry: RetryConfig) -> SqliteQueueStore {
    let db = open_database(dir.path().join("flow.db"), 4).expect("db opened");
    SqliteQueueStore::new(db, "store-1", RetryPolicy::new(retry))
}

fn item(entity_id: &str, operation: SyncOperation) -> QueueItem {
    QueueItem::new("store-1", "sale", entity_id, operation, SyncDirection::Push, "{}")
}

#[tokio::test]
async fn operations_for_one_entity_dispatch_in_arrival_order() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_with(&dir, RetryConfig::default());

    let create = store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("create");
    let update = store.enqueue(item("sale-1", SyncOperation::Update)).await.expect("update");
    let other = store.enqueue(item("sale-2", SyncOperation::Create)).await.expect("other");

    // The update is held back while the earlier create is unresolved.
    let batch = store.claim_batch(10).await.expect("first claim");
    let ids: Vec<_> = batch.iter().map(|i| i.id.clone()).collect();
    assert!(ids.contains(&create));
    assert!(ids.contains(&other));
    assert!(!ids.contains(&update));

    store.mark_succeeded(&create).await.expect("create resolved");
    let batch = store.claim_batch(10).await.expect("second claim");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, update);
}

#[tokio::test]
async fn transient_failures_exhaust_into_dead_letter() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_with(&dir, fast_retry());
    let id = store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("enqueued");

    let mut last_attempts = 0;
    for round in 1..=5 {
        // Retry delays are 1-2ms; wait them out before reclaiming.
        let mut batch = store.claim_batch(10).await.expect("claim");
        for _ in 0..100 {
            if !batch.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            batch = store.claim_batch(10).await.expect("claim");
        }
        assert_eq!(batch.len(), 1, "round {round} claimed nothing");
        assert!(batch[0].attempt_count >= last_attempts, "attempt count went backwards");
        last_attempts = batch[0].attempt_count;

        let outcome = store
            .mark_failed(&id, ErrorCategory::Transient, "connection reset")
            .await
            .expect("marked failed");
        if round < 5 {
            assert!(matches!(outcome, FailureOutcome::Scheduled { .. }), "round {round}");
        } else {
            assert_eq!(
                outcome,
                FailureOutcome::DeadLettered { reason: DeadLetterReason::MaxAttemptsExceeded }
            );
        }
    }

    assert_eq!(store.pending_count().await.expect("count"), 0);
    assert_eq!(store.backoff_count().await.expect("count"), 0);
}

#[tokio::test]
async fn unknown_failures_use_the_tighter_ceiling() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_with(&dir, fast_retry());
    let id = store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("enqueued");

    store.claim_batch(10).await.expect("claim");
    let first = store.mark_failed(&id, ErrorCategory::Unknown, "???").await.expect("first");
    assert!(matches!(first, FailureOutcome::Scheduled { .. }));

    tokio::time::sleep(Duration::from_millis(10)).await;
    store.claim_batch(10).await.expect("claim");
    let second = store.mark_failed(&id, ErrorCategory::Unknown, "???").await.expect("second");
    assert_eq!(
        second,
        FailureOutcome::DeadLettered { reason: DeadLetterReason::MaxAttemptsExceeded }
    );
}

#[tokio::test]
async fn non_retryable_categories_dead_letter_immediately() {
    let cases = [
        (ErrorCategory::Permanent, DeadLetterReason::PermanentError),
        (ErrorCategory::Structural, DeadLetterReason::StructuralFailure),
        (ErrorCategory::Conflict, DeadLetterReason::ConflictError),
    ];
    for (category, expected_reason) in cases {
        let dir = TempDir::new().expect("temp dir");
        let store = store_with(&dir, RetryConfig::default());
        let id = store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("enqueued");
        store.claim_batch(10).await.expect("claim");
        let outcome =
            store.mark_failed(&id, category, "rejected").await.expect("marked failed");
        assert_eq!(outcome, FailureOutcome::DeadLettered { reason: expected_reason });
    }
}

#[tokio::test]
async fn failed_items_in_backoff_are_counted_separately() {
    let dir = TempDir::new().expect("temp dir");
    let retry = RetryConfig { base_delay_ms: 60_000, max_delay_ms: 120_000, ..fast_retry() };
    let store = store_with(&dir, retry);
    let id = store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("enqueued");

    store.claim_batch(10).await.expect("claim");
    store.mark_failed(&id, ErrorCategory::Transient, "timeout").await.expect("failed");

    assert_eq!(store.pending_count().await.expect("pending"), 0);
    assert_eq!(store.backoff_count().await.expect("backoff"), 1);
    assert!(store.claim_batch(10).await.expect("claim").is_empty());

    let stats = store.stats().await.expect("stats");
    assert_eq!(stats.backoff, 1);
    assert_eq!(stats.total(), 1);
}

#[tokio::test]
async fn released_claims_keep_their_attempt_count() {
    let dir = TempDir::new().expect("temp dir");
    let store = store_with(&dir, RetryConfig::default());
    let id = store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("enqueued");

    let batch = store.claim_batch(10).await.expect("claim");
    assert_eq!(batch[0].attempt_count, 0);
    store.release_claim(&id).await.expect("released");

    let batch = store.claim_batch(10).await.expect("reclaim");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].attempt_count, 0);
}

#[tokio::test]
async fn stuck_claims_are_reclaimed_after_timeout() {
    let dir = TempDir::new().expect("temp dir");
    let db = open_database(dir.path().join("flow.db"), 4).expect("db opened");
    let store = SqliteQueueStore::new(db, "store-1", RetryPolicy::new(RetryConfig::default()))
        .with_stuck_claim_timeout_ms(1);
    store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("enqueued");

    assert_eq!(store.claim_batch(10).await.expect("claim").len(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    // The abandoned claim flows back to pending inside the next claim.
    assert_eq!(store.claim_batch(10).await.expect("reclaim").len(), 1);
}

#[tokio::test]
async fn open_breaker_suppresses_claims() {
    let dir = TempDir::new().expect("temp dir");
    let db = open_database(dir.path().join("flow.db"), 4).expect("db opened");
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
        failure_threshold: 1,
        reset_timeout_ms: 60_000,
        ..BreakerConfig::default()
    }));
    let store = SqliteQueueStore::new(db, "store-1", RetryPolicy::new(RetryConfig::default()))
        .with_breaker(Arc::clone(&breaker));
    store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("enqueued");

    breaker.record_failure();
    assert!(store.claim_batch(10).await.expect("claim").is_empty());

    breaker.reset();
    assert_eq!(store.claim_batch(10).await.expect("claim").len(), 1);
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_item() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(store_with(&dir, RetryConfig::default()));
    for n in 0..20 {
        store
            .enqueue(item(&format!("sale-{n}"), SyncOperation::Create))
            .await
            .expect("enqueued");
    }

    let a = Arc::clone(&store);
    let b = Arc::clone(&store);
    let (left, right) =
        tokio::join!(async move { a.claim_batch(10).await }, async move { b.claim_batch(10).await });
    let left = left.expect("left claim");
    let right = right.expect("right claim");

    for item in &left {
        assert!(
            !right.iter().any(|other| other.id == item.id),
            "item {} claimed twice",
            item.id
        );
    }
    assert_eq!(left.len() + right.len(), 20);
}

#[tokio::test]
async fn manual_dead_letter_bypasses_the_retry_budget() {
    use tillsync_core::sync::ports::DeadLetterStore;
    use tillsync_infra::SqliteDeadLetterStore;

    let dir = TempDir::new().expect("temp dir");
    let db = open_database(dir.path().join("flow.db"), 4).expect("db opened");
    let store = SqliteQueueStore::new(
        Arc::clone(&db),
        "store-1",
        RetryPolicy::new(RetryConfig::default()),
    );
    let dlq = SqliteDeadLetterStore::new(db, "store-1");

    let id = store.enqueue(item("sale-1", SyncOperation::Create)).await.expect("enqueued");
    store.dead_letter_manually(&id, "operator removed").await.expect("dead-lettered");

    assert_eq!(store.pending_count().await.expect("pending"), 0);
    let entry = dlq.get(&id).await.expect("fetched").expect("entry exists");
    assert_eq!(entry.reason, DeadLetterReason::Manual);
    assert_eq!(entry.last_error.as_deref(), Some("operator removed"));
    assert_eq!(entry.attempt_count, 0);
}

#[tokio::test]
async fn dead_letter_entry_preserves_item_details() {
    use tillsync_core::sync::ports::DeadLetterStore;
    use tillsync_infra::SqliteDeadLetterStore;

    let dir = TempDir::new().expect("temp dir");
    let db = open_database(dir.path().join("flow.db"), 4).expect("db opened");
    let store = SqliteQueueStore::new(
        Arc::clone(&db),
        "store-1",
        RetryPolicy::new(RetryConfig::default()),
    );
    let dlq = SqliteDeadLetterStore::new(db, "store-1");

    let mut queued = item("sale-9", SyncOperation::Delete);
    queued.payload = r#"{"reason":"void"}"#.into();
    let id = store.enqueue(queued).await.expect("enqueued");
    store.claim_batch(10).await.expect("claim");
    store.mark_failed(&id, ErrorCategory::Structural, "schema drift").await.expect("failed");

    let entries = dlq.list(10, 0).await.expect("listed");
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.id, id);
    assert_eq!(entry.entity_id, "sale-9");
    assert_eq!(entry.operation, SyncOperation::Delete);
    assert_eq!(entry.payload, r#"{"reason":"void"}"#);
    assert_eq!(entry.reason, DeadLetterReason::StructuralFailure);
    assert_eq!(entry.error_category, ErrorCategory::Structural);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.last_error.as_deref(), Some("schema drift"));
}
