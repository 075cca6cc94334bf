//! SQLite-backed implementation of the dead-letter store port.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tillsync_domain::{
    DeadLetterEntry, DeadLetterReason, DeadLetterStats, ErrorCategory, QueueItemStatus,
    Result as DomainResult, SyncDirection, SyncOperation, TillSyncError,
};
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;

use tillsync_core::sync::ports::DeadLetterStore;

use super::manager::DbManager;
use super::queue_repository::parse_or_warn;
use crate::errors::{map_join_error, map_sql_error};

const DLQ_COLUMNS_SQL: &str = "SELECT id, store_id, entity_type, entity_id, operation, \
     direction, payload, attempt_count, error_category, reason, last_error, created_at, \
     failed_at FROM sync_dead_letter";

const DLQ_LIST_SQL: &str = "SELECT id, store_id, entity_type, entity_id, operation, direction, \
     payload, attempt_count, error_category, reason, last_error, created_at, failed_at \
     FROM sync_dead_letter WHERE store_id = ?1 \
     ORDER BY failed_at DESC LIMIT ?2 OFFSET ?3";

const DLQ_COUNT_SQL: &str = "SELECT COUNT(*) FROM sync_dead_letter WHERE store_id = ?1";

const DLQ_DELETE_SQL: &str = "DELETE FROM sync_dead_letter WHERE id = ?1 AND store_id = ?2";

const DLQ_PURGE_SQL: &str =
    "DELETE FROM sync_dead_letter WHERE store_id = ?1 AND failed_at < ?2";

const DLQ_OLDEST_IDS_SQL: &str = "SELECT id FROM sync_dead_letter WHERE store_id = ?1 \
     ORDER BY failed_at ASC LIMIT ?2";

const REPLAY_INSERT_SQL: &str = "INSERT INTO sync_queue \
     (id, store_id, entity_type, entity_id, operation, direction, payload, status, \
      attempt_count, next_attempt_at, error_category, last_error, created_at, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, NULL, NULL, ?9, ?9)";

/// SQLite-backed dead-letter store scoped to one tenant.
pub struct SqliteDeadLetterStore {
    db: Arc<DbManager>,
    store_id: String,
}

impl SqliteDeadLetterStore {
    pub fn new(db: Arc<DbManager>, store_id: impl Into<String>) -> Self {
        Self { db, store_id: store_id.into() }
    }

    /// Re-queue one entry inside an open transaction. Returns the new queue
    /// item id.
    fn replay_one(tx: &rusqlite::Transaction<'_>, store_id: &str, entry_id: &str) -> DomainResult<String> {
        let sql = format!("{DLQ_COLUMNS_SQL} WHERE id = ?1 AND store_id = ?2");
        let entry = tx
            .query_row(&sql, params![entry_id, store_id], map_dead_letter_row)
            .optional()
            .map_err(map_sql_error)?
            .ok_or_else(|| TillSyncError::NotFound(format!("dead-letter entry {entry_id}")))?;

        let now = Utc::now().timestamp_millis();
        let new_id = Uuid::new_v4().to_string();
        tx.execute(
            REPLAY_INSERT_SQL,
            params![
                new_id,
                entry.store_id,
                entry.entity_type,
                entry.entity_id,
                entry.operation.to_string(),
                entry.direction.to_string(),
                entry.payload,
                QueueItemStatus::Pending.to_string(),
                now,
            ],
        )
        .map_err(map_sql_error)?;
        tx.execute(DLQ_DELETE_SQL, params![entry_id, store_id]).map_err(map_sql_error)?;
        Ok(new_id)
    }

    fn stats_blocking(conn: &Connection, store_id: &str) -> DomainResult<DeadLetterStats> {
        let mut stats = DeadLetterStats::default();
        let (total, oldest, newest): (i64, Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), MIN(failed_at), MAX(failed_at) FROM sync_dead_letter \
                 WHERE store_id = ?1",
                params![store_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(map_sql_error)?;
        stats.total = total.max(0) as u64;
        stats.oldest_failed_at = oldest;
        stats.newest_failed_at = newest;

        for (column, target) in [
            ("reason", &mut stats.by_reason),
            ("entity_type", &mut stats.by_entity_type),
            ("error_category", &mut stats.by_error_category),
        ] {
            let sql = format!(
                "SELECT {column}, COUNT(*) FROM sync_dead_letter WHERE store_id = ?1 \
                 GROUP BY {column}"
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
impl DeadLetterStore for SqliteDeadLetterStore {
    async fn list(&self, limit: usize, offset: usize) -> DomainResult<Vec<DeadLetterEntry>> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            let mut stmt = conn.prepare(DLQ_LIST_SQL).map_err(map_sql_error)?;
            let entries = stmt
                .query_map(
                    params![store_id, limit as i64, offset as i64],
                    map_dead_letter_row,
                )
                .map_err(map_sql_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sql_error);
            entries
        })
        .await
        .map_err(map_join_error)?
    }

    async fn get(&self, entry_id: &str) -> DomainResult<Option<DeadLetterEntry>> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let entry_id = entry_id.to_string();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            let sql = format!("{DLQ_COLUMNS_SQL} WHERE id = ?1 AND store_id = ?2");
            conn.query_row(&sql, params![entry_id, store_id], map_dead_letter_row)
                .optional()
                .map_err(map_sql_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn count(&self) -> DomainResult<u64> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            let total: i64 = conn
                .query_row(DLQ_COUNT_SQL, params![store_id], |row| row.get(0))
                .map_err(map_sql_error)?;
            Ok(total.max(0) as u64)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn stats(&self) -> DomainResult<DeadLetterStats> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            Self::stats_blocking(&conn, &store_id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn replay(&self, entry_id: &str) -> DomainResult<String> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let entry_id = entry_id.to_string();
        task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            let new_id = Self::replay_one(&tx, &store_id, &entry_id)?;
            tx.commit().map_err(map_sql_error)?;
            info!(
                target: "tillsync::dead_letter",
                entry_id = %entry_id,
                new_item_id = %new_id,
                "dead-letter entry replayed"
            );
            Ok(new_id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn replay_batch(&self, limit: usize) -> DomainResult<u64> {
        if limit == 0 {
            return Ok(0);
        }
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            let tx = conn.transaction().map_err(map_sql_error)?;
            let ids = {
                let mut stmt = tx.prepare(DLQ_OLDEST_IDS_SQL).map_err(map_sql_error)?;
                let ids = stmt
                    .query_map(params![store_id, limit as i64], |row| row.get::<_, String>(0))
                    .map_err(map_sql_error)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(map_sql_error)?;
                ids
            };
            let mut replayed = 0u64;
            for entry_id in &ids {
                match Self::replay_one(&tx, &store_id, entry_id) {
                    Ok(_) => replayed += 1,
                    Err(err) => warn!(
                        target: "tillsync::dead_letter",
                        entry_id = %entry_id,
                        error = %err,
                        "failed to replay entry, skipping"
                    ),
                }
            }
            tx.commit().map_err(map_sql_error)?;
            info!(target: "tillsync::dead_letter", replayed, "dead-letter batch replayed");
            Ok(replayed)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn delete(&self, entry_id: &str) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        let entry_id = entry_id.to_string();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            let deleted = conn
                .execute(DLQ_DELETE_SQL, params![entry_id, store_id])
                .map_err(map_sql_error)?;
            if deleted == 0 {
                return Err(TillSyncError::NotFound(format!("dead-letter entry {entry_id}")));
            }
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn purge_older_than(&self, cutoff_ms: i64) -> DomainResult<u64> {
        let db = Arc::clone(&self.db);
        let store_id = self.store_id.clone();
        task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            let purged = conn
                .execute(DLQ_PURGE_SQL, params![store_id, cutoff_ms])
                .map_err(map_sql_error)?;
            if purged > 0 {
                info!(target: "tillsync::dead_letter", purged, "purged expired entries");
            }
            Ok(purged as u64)
        })
        .await
        .map_err(map_join_error)?
    }
}

fn map_dead_letter_row(row: &Row<'_>) -> rusqlite::Result<DeadLetterEntry> {
    let operation: String = row.get(4)?;
    let direction: String = row.get(5)?;
    let category: String = row.get(8)?;
    let reason: String = row.get(9)?;
    Ok(DeadLetterEntry {
        id: row.get(0)?,
        store_id: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        operation: parse_or_warn(&operation, SyncOperation::Update),
        direction: parse_or_warn(&direction, SyncDirection::Push),
        payload: row.get(6)?,
        attempt_count: row.get::<_, i64>(7)?.max(0) as u32,
        error_category: parse_or_warn(&category, ErrorCategory::Unknown),
        reason: parse_or_warn(&reason, DeadLetterReason::Manual),
        last_error: row.get(10)?,
        created_at: row.get(11)?,
        failed_at: row.get(12)?,
    })
}
