//! SQLite-backed implementation of the queue store port.
//!
//! All SQL runs on the blocking thread pool. Claim and failure handling are
//! transactional so a crash can never lose an item or double-claim it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tillsync_domain::{
    CircuitBreakerSnapshot, CircuitState, DeadLetterReason, ErrorCategory, QueueItem,
    QueueItemStatus, QueueStats, Result as DomainResult, SyncDirection, SyncOperation,
    TillSyncError,
};
use tokio::task;
use tracing::{debug, warn};

use tillsync_core::sync::circuit_breaker::CircuitBreaker;
use tillsync_core::sync::ports::{FailureOutcome, QueueStore};
use tillsync_core::sync::retry::{RetryDecision, RetryPolicy};

use super::manager::DbManager;
use crate::errors::{map_join_error, map_sql_error};

const DEFAULT_STUCK_CLAIM_TIMEOUT_MS: i64 = 300_000;

const QUEUE_INSERT_SQL: &str = "INSERT INTO sync_queue \
     (id, store_id, entity_type, entity_id, operation, direction, payload, status, \
      attempt_count, next_attempt_at, error_category, last_error, created_at, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

const COALESCE_SELECT_SQL: &str = "SELECT id FROM sync_queue \
     WHERE store_id = ?1 AND entity_type = ?2 AND entity_id = ?3 AND operation = ?4 \
       AND status = 'pending' \
     LIMIT 1";

const COALESCE_UPDATE_SQL: &str =
    "UPDATE sync_queue SET payload = ?1, updated_at = ?2 WHERE id = ?3";

const RECLAIM_STUCK_SQL: &str = "UPDATE sync_queue \
     SET status = 'pending', claimed_at = NULL, updated_at = ?1 \
     WHERE store_id = ?2 AND status = 'syncing' AND claimed_at <= ?3";

/// Eligible items, oldest first. The NOT EXISTS guard holds an item back
/// while any earlier item for the same entity is unresolved, so operations
/// against one entity always reach the remote in arrival order.
const CLAIM_SELECT_SQL: &str = "SELECT id, store_id, entity_type, entity_id, operation, \
     direction, payload, status, attempt_count, next_attempt_at, error_category, last_error, \
     created_at, updated_at \
     FROM sync_queue AS q \
     WHERE q.store_id = ?1 \
       AND q.status IN ('pending', 'failed') \
       AND q.next_attempt_at <= ?2 \
       AND NOT EXISTS ( \
           SELECT 1 FROM sync_queue AS earlier \
           WHERE earlier.store_id = q.store_id \
             AND earlier.entity_type = q.entity_type \
             AND earlier.entity_id = q.entity_id \
             AND earlier.seq < q.seq \
       ) \
     ORDER BY q.seq ASC \
     LIMIT ?3";

const CLAIM_MARK_SQL: &str = "UPDATE sync_queue \
     SET status = 'syncing', claimed_at = ?1, updated_at = ?1 \
     WHERE id = ?2";

const SELECT_BY_ID_SQL: &str = "SELECT id, store_id, entity_type, entity_id, operation, \
     direction, payload, status, attempt_count, next_attempt_at, error_category, last_error, \
     created_at, updated_at \
     FROM sync_queue WHERE id = ?1 AND store_id = ?2";

const DELETE_SQL: &str = "DELETE FROM sync_queue WHERE id = ?1 AND store_id = ?2";

const MARK_FAILED_SQL: &str = "UPDATE sync_queue \
     SET status = 'failed', attempt_count = ?1, next_attempt_at = ?2, error_category = ?3, \
         last_error = ?4, claimed_at = NULL, updated_at = ?5 \
     WHERE id = ?6";

const DEAD_LETTER_INSERT_SQL: &str = "INSERT INTO sync_dead_letter \
     (id, store_id, entity_type, entity_id, operation, direction, payload, attempt_count, \
      error_category, reason, last_error, created_at, failed_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

const RELEASE_CLAIM_SQL: &str = "UPDATE sync_queue \
     SET status = 'pending', claimed_at = NULL, updated_at = ?1 \
     WHERE id = ?2 AND store_id = ?3 AND status = 'syncing'";

const PENDING_COUNT_SQL: &str = "SELECT COUNT(*) FROM sync_queue \
     WHERE store_id = ?1 AND status IN ('pending', 'failed') AND next_attempt_at <= ?2";

const BACKOFF_COUNT_SQL: &str = "SELECT COUNT(*) FROM sync_queue \
     WHERE store_id = ?1 AND status = 'failed' AND next_attempt_at > ?2";

const SYNCING_COUNT_SQL: &str =
    "SELECT COUNT(*) FROM sync_queue WHERE store_id = ?1 AND status = 'syncing'";

const OLDEST_PENDING_SQL: &str = "SELECT MIN(created_at) FROM sync_queue \
     WHERE store_id = ?1 AND status IN ('pending', 'failed') AND next_attempt_at <= ?2";

const BREAKER_UPSERT_SQL: &str = "INSERT INTO circuit_breaker_state \
     (store_id, state, failures_in_window, open_until, current_reset_timeout_ms, \
      half_open_successes, total_trips, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
     ON CONFLICT(store_id) DO UPDATE SET \
         state = excluded.state, \
         failures_in_window = excluded.failures_in_window, \
         open_until = excluded.open_until, \
         current_reset_timeout_ms = excluded.current_reset_timeout_ms, \
         half_open_successes = excluded.half_open_successes, \
         total_trips = excluded.total_trips, \
         updated_at = excluded.updated_at";

const BREAKER_SELECT_SQL: &str = "SELECT state, failures_in_window, open_until, \
     current_reset_timeout_ms, half_open_successes, total_trips \
     FROM circuit_breaker_state WHERE store_id = ?1";

/// SQLite-backed queue store scoped to one tenant.
pub struct SqliteQueueStore {
    db: Arc<DbManager>,
    store_id: String,
    retry: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    stuck_claim_timeout_ms: i64,
}

impl SqliteQueueStore {
    pub fn new(db: Arc<DbManager>, store_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            db,
            store_id: store_id.into(),
            retry,
            breaker: None,
            stuck_claim_timeout_ms: DEFAULT_STUCK_CLAIM_TIMEOUT_MS,
        }
    }

    /// Gate claims on a circuit breaker: while the breaker is open and its
    /// reset deadline has not passed, `claim_batch` returns nothing.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_stuck_claim_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.stuck_claim_timeout_ms = timeout_ms.max(1);
        self
    }

    fn breaker_refuses_claims(&self) -> bool {
        let Some(breaker) = &self.breaker else { return false };
        let snapshot = breaker.snapshot();
        snapshot.state == CircuitState::Open
            && snapshot.open_until.is_some_and(|deadline| now_ms() < deadline)
    }

    fn enqueue_blocking(conn: &mut Connection, item: &QueueItem) -> DomainResult<String> {
        let now = now_ms();
        let tx = conn.transaction().map_err(map_sql_error)?;
        let existing: Option<String> = tx
            .query_row(
                COALESCE_SELECT_SQL,
                params![item.store_id, item.entity_type, item.entity_id, item.operation.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sql_error)?;
        let id = match existing {
            Some(existing_id) => {
                tx.execute(COALESCE_UPDATE_SQL, params![item.payload, now, existing_id])
                    .map_err(map_sql_error)?;
                debug!(
                    target: "tillsync::queue",
                    item_id = %existing_id,
                    entity_id = %item.entity_id,
                    "enqueue coalesced with pending item"
                );
                existing_id
            }
            None => {
                tx.execute(
                    QUEUE_INSERT_SQL,
                    params![
                        item.id,
                        item.store_id,
                        item.entity_type,
                        item.entity_id,
                        item.operation.to_string(),
                        item.direction.to_string(),
                        item.payload,
                        item.status.to_string(),
                        item.attempt_count,
                        item.next_attempt_at,
                        item.error_category.map(|c| c.to_string()),
                        item.last_error,
                        item.created_at,
                        item.updated_at,
                    ],
                )
                .map_err(map_sql_error)?;
                item.id.clone()
            }
        };
        tx.commit().map_err(map_sql_error)?;
        Ok(id)
    }

    fn claim_batch_blocking(
        conn: &mut Connection,
        store_id: &str,
        limit: usize,
        stuck_claim_timeout_ms: i64,
    ) -> DomainResult<Vec<QueueItem>> {
        let now = now_ms();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sql_error)?;

        // Claims abandoned by a crashed or wedged worker flow back first.
        let reclaimed = tx
            .execute(RECLAIM_STUCK_SQL, params![now, store_id, now - stuck_claim_timeout_ms])
            .map_err(map_sql_error)?;
        if reclaimed > 0 {
            warn!(target: "tillsync::queue", reclaimed, "reclaimed stuck claims");
        }

        let mut items = {
            let mut stmt = tx.prepare(CLAIM_SELECT_SQL).map_err(map_sql_error)?;
            let rows = stmt
                .query_map(params![store_id, now, limit as i64], map_queue_row)
                .map_err(map_sql_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sql_error)?;
            rows
        };
        for item in &mut items {
            tx.execute(CLAIM_MARK_SQL, params![now, item.id]).map_err(map_sql_error)?;
            item.status = QueueItemStatus::Syncing;
            item.updated_at = now;
        }
        tx.commit().map_err(map_sql_error)?;
        Ok(items)
    }

    fn mark_failed_blocking(
        conn: &mut Connection,
        store_id: &str,
        item_id: &str,
        category: ErrorCategory,
        error: &str,
        retry: &RetryPolicy,
    ) -> DomainResult<FailureOutcome> {
        let now = now_ms();
        let tx = conn.transaction().map_err(map_sql_error)?;
        let item = tx
            .query_row(SELECT_BY_ID_SQL, params![item_id, store_id], map_queue_row)
            .optional()
            .map_err(map_sql_error)?
            .ok_or_else(|| TillSyncError::NotFound(format!("queue item {item_id}")))?;

        let attempts = item.attempt_count + 1;
        let outcome = match retry.decide(attempts, category) {
            RetryDecision::Retry { delay_ms } => {
                let next_attempt_at = now + delay_ms as i64;
                tx.execute(
                    MARK_FAILED_SQL,
                    params![attempts, next_attempt_at, category.to_string(), error, now, item_id],
                )
                .map_err(map_sql_error)?;
                FailureOutcome::Scheduled { next_attempt_at }
            }
            RetryDecision::DeadLetter { reason } => {
                tx.execute(
                    DEAD_LETTER_INSERT_SQL,
                    params![
                        item.id,
                        item.store_id,
                        item.entity_type,
                        item.entity_id,
                        item.operation.to_string(),
                        item.direction.to_string(),
                        item.payload,
                        attempts,
                        category.to_string(),
                        reason.to_string(),
                        error,
                        item.created_at,
                        now,
                    ],
                )
                .map_err(map_sql_error)?;
                tx.execute(DELETE_SQL, params![item_id, store_id]).map_err(map_sql_error)?;
                FailureOutcome::DeadLettered { reason }
            }
        };
        tx.commit().map_err(map_sql_error)?;
        Ok(outcome)
    }

    /// Operator escape hatch: move one item straight to the dead-letter
    /// store with reason `manual`, regardless of its remaining retry budget.
    pub async fn dead_letter_manually(&self, item_id: &str, note: &str) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let item_id = item_id.to_string();
        let note = note.to_string();
        task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            let now = now_ms();
            let tx = conn.transaction().map_err(map_sql_error)?;
            let item = tx
                .query_row(SELECT_BY_ID_SQL, params![item_id, store_id], map_queue_row)
                .optional()
                .map_err(map_sql_error)?
                .ok_or_else(|| TillSyncError::NotFound(format!("queue item {item_id}")))?;
            tx.execute(
                DEAD_LETTER_INSERT_SQL,
                params![
                    item.id,
                    item.store_id,
                    item.entity_type,
                    item.entity_id,
                    item.operation.to_string(),
                    item.direction.to_string(),
                    item.payload,
                    item.attempt_count,
                    item.error_category.unwrap_or(ErrorCategory::Unknown).to_string(),
                    DeadLetterReason::Manual.to_string(),
                    note,
                    item.created_at,
                    now,
                ],
            )
            .map_err(map_sql_error)?;
            tx.execute(DELETE_SQL, params![item_id, store_id]).map_err(map_sql_error)?;
            tx.commit().map_err(map_sql_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }

    fn stats_blocking(conn: &Connection, store_id: &str) -> DomainResult<QueueStats> {
        let now = now_ms();
        let mut stats = QueueStats {
            pending: count(conn, PENDING_COUNT_SQL, store_id, Some(now))?,
            syncing: count(conn, SYNCING_COUNT_SQL, store_id, None)?,
            backoff: count(conn, BACKOFF_COUNT_SQL, store_id, Some(now))?,
            ..QueueStats::default()
        };
        for (column, target) in [
            ("entity_type", &mut stats.by_entity_type),
            ("operation", &mut stats.by_operation),
            ("direction", &mut stats.by_direction),
        ] {
            let sql = format!(
                "SELECT {column}, COUNT(*) FROM sync_queue WHERE store_id = ?1 GROUP BY {column}"
            );
            let mut stmt = conn.prepare(&sql).map_err(map_sql_error)?;
            let rows = stmt
                .query_map(params![store_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(map_sql_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sql_error)?;
            for (key, value) in rows {
                target.insert(key, value.max(0) as u64);
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, item: QueueItem) -> DomainResult<String> {
        if item.store_id != self.store_id {
            return Err(TillSyncError::InvalidInput(format!(
                "item belongs to store {}, this queue serves {}",
                item.store_id, self.store_id
            )));
        }
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            Self::enqueue_blocking(&mut conn, &item)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn claim_batch(&self, limit: usize) -> DomainResult<Vec<QueueItem>> {
        if limit == 0 || self.breaker_refuses_claims() {
            return Ok(Vec::new());
        }
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let stuck_timeout = self.stuck_claim_timeout_ms;
        task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            Self::claim_batch_blocking(&mut conn, &store_id, limit, stuck_timeout)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_succeeded(&self, item_id: &str) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let item_id = item_id.to_string();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            let deleted =
                conn.execute(DELETE_SQL, params![item_id, store_id]).map_err(map_sql_error)?;
            if deleted == 0 {
                return Err(TillSyncError::NotFound(format!("queue item {item_id}")));
            }
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_failed(
        &self,
        item_id: &str,
        category: ErrorCategory,
        error: &str,
    ) -> DomainResult<FailureOutcome> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let item_id = item_id.to_string();
        let error = error.to_string();
        let retry = self.retry.clone();
        task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            Self::mark_failed_blocking(&mut conn, &store_id, &item_id, category, &error, &retry)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn release_claim(&self, item_id: &str) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let item_id = item_id.to_string();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            conn.execute(RELEASE_CLAIM_SQL, params![now_ms(), item_id, store_id])
                .map_err(map_sql_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn pending_count(&self) -> DomainResult<u64> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            count(&conn, PENDING_COUNT_SQL, &store_id, Some(now_ms()))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn backoff_count(&self) -> DomainResult<u64> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            count(&conn, BACKOFF_COUNT_SQL, &store_id, Some(now_ms()))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn stats(&self) -> DomainResult<QueueStats> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            Self::stats_blocking(&conn, &store_id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn oldest_pending_age_ms(&self) -> DomainResult<Option<u64>> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            let now = now_ms();
            let oldest: Option<i64> = conn
                .query_row(OLDEST_PENDING_SQL, params![store_id, now], |row| row.get(0))
                .map_err(map_sql_error)?;
            Ok(oldest.map(|created| (now - created).max(0) as u64))
        })
        .await
        .map_err(map_join_error)?
    }

    async fn load_breaker_snapshot(&self) -> DomainResult<Option<CircuitBreakerSnapshot>> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            conn.query_row(BREAKER_SELECT_SQL, params![store_id], map_breaker_row)
                .optional()
                .map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn save_breaker_snapshot(&self, snapshot: &CircuitBreakerSnapshot) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let snapshot = snapshot.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            conn.execute(
                BREAKER_UPSERT_SQL,
                params![
                    store_id,
                    snapshot.state.to_string(),
                    snapshot.failures_in_window,
                    snapshot.open_until,
                    snapshot.current_reset_timeout_ms as i64,
                    snapshot.half_open_successes,
                    snapshot.total_trips as i64,
                    now_ms(),
                ],
            )
            .map_err(map_sql_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn count(conn: &Connection, sql: &str, store_id: &str, now: Option<i64>) -> DomainResult<u64> {
    let value: i64 = match now {
        Some(now) => conn
            .query_row(sql, params![store_id, now], |row| row.get(0))
            .map_err(map_sql_error)?,
        None => {
            conn.query_row(sql, params![store_id], |row| row.get(0)).map_err(map_sql_error)?
        }
    };
    Ok(value.max(0) as u64)
}

/// Map a full `sync_queue` row (column order as in the SELECT statements
/// above).
pub(crate) fn map_queue_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let operation: String = row.get(4)?;
    let direction: String = row.get(5)?;
    let status: String = row.get(7)?;
    let category: Option<String> = row.get(10)?;
    Ok(QueueItem {
        id: row.get(0)?,
        store_id: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        operation: parse_or_warn(&operation, SyncOperation::Update),
        direction: parse_or_warn(&direction, SyncDirection::Push),
        payload: row.get(6)?,
        status: parse_or_warn(&status, QueueItemStatus::Pending),
        attempt_count: row.get::<_, i64>(8)?.max(0) as u32,
        next_attempt_at: row.get(9)?,
        error_category: category.map(|c| parse_or_warn(&c, ErrorCategory::Unknown)),
        last_error: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn map_breaker_row(row: &Row<'_>) -> rusqlite::Result<CircuitBreakerSnapshot> {
    let state: String = row.get(0)?;
    Ok(CircuitBreakerSnapshot {
        state: parse_or_warn(&state, CircuitState::Closed),
        failures_in_window: row.get::<_, i64>(1)?.max(0) as u32,
        open_until: row.get(2)?,
        current_reset_timeout_ms: row.get::<_, i64>(3)?.max(0) as u64,
        half_open_successes: row.get::<_, i64>(4)?.max(0) as u32,
        total_trips: row.get::<_, i64>(5)?.max(0) as u64,
    })
}

/// Parse a persisted enum value, falling back rather than poisoning reads
/// when a newer schema wrote a value this build does not know.
pub(crate) fn parse_or_warn<T>(raw: &str, fallback: T) -> T
where
    T: std::str::FromStr + Copy,
{
    raw.parse().unwrap_or_else(|_| {
        warn!(
            target: "tillsync::database",
            value = raw,
            "unrecognised stored value, using fallback"
        );
        fallback
    })
}
