//! Queue item model and lifecycle enums.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TillSyncError;

/// Business operation captured by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    Activate,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOperation::Create => write!(f, "create"),
            SyncOperation::Update => write!(f, "update"),
            SyncOperation::Delete => write!(f, "delete"),
            SyncOperation::Activate => write!(f, "activate"),
        }
    }
}

impl FromStr for SyncOperation {
    type Err = TillSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            "activate" => Ok(SyncOperation::Activate),
            other => Err(TillSyncError::InvalidInput(format!("unknown sync operation: {other}"))),
        }
    }
}

/// Direction of a sync item relative to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Local mutation flowing to the remote service.
    Push,
    /// Remote change flowing into the local store.
    Pull,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::Push => write!(f, "push"),
            SyncDirection::Pull => write!(f, "pull"),
        }
    }
}

impl FromStr for SyncDirection {
    type Err = TillSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(SyncDirection::Push),
            "pull" => Ok(SyncDirection::Pull),
            other => Err(TillSyncError::InvalidInput(format!("unknown sync direction: {other}"))),
        }
    }
}

/// Lifecycle status of a queue item.
///
/// `pending → syncing → deleted on success | failed`; `failed` items become
/// claimable again once their `next_attempt_at` passes, or move to the
/// dead-letter store when retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Syncing,
    Failed,
    DeadLettered,
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueItemStatus::Pending => write!(f, "pending"),
            QueueItemStatus::Syncing => write!(f, "syncing"),
            QueueItemStatus::Failed => write!(f, "failed"),
            QueueItemStatus::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

impl FromStr for QueueItemStatus {
    type Err = TillSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "syncing" => Ok(QueueItemStatus::Syncing),
            "failed" => Ok(QueueItemStatus::Failed),
            "dead_lettered" => Ok(QueueItemStatus::DeadLettered),
            other => Err(TillSyncError::InvalidInput(format!("unknown queue status: {other}"))),
        }
    }
}

/// Classification of a failed send, set by the remote-send collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retryable infrastructure/network issue.
    Transient,
    /// Remote rejected the data; retrying cannot help.
    Permanent,
    /// Client/server contract drift; needs a code fix.
    Structural,
    /// Concurrent modification detected by the remote.
    Conflict,
    /// Unclassified; treated as retryable with a tighter attempt ceiling.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Structural => write!(f, "structural"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ErrorCategory {
    type Err = TillSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "structural" => Ok(ErrorCategory::Structural),
            "conflict" => Ok(ErrorCategory::Conflict),
            "unknown" => Ok(ErrorCategory::Unknown),
            other => Err(TillSyncError::InvalidInput(format!("unknown error category: {other}"))),
        }
    }
}

/// Why an item landed in the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxAttemptsExceeded,
    PermanentError,
    StructuralFailure,
    ConflictError,
    Manual,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::MaxAttemptsExceeded => write!(f, "max_attempts_exceeded"),
            DeadLetterReason::PermanentError => write!(f, "permanent_error"),
            DeadLetterReason::StructuralFailure => write!(f, "structural_failure"),
            DeadLetterReason::ConflictError => write!(f, "conflict_error"),
            DeadLetterReason::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for DeadLetterReason {
    type Err = TillSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_attempts_exceeded" => Ok(DeadLetterReason::MaxAttemptsExceeded),
            "permanent_error" => Ok(DeadLetterReason::PermanentError),
            "structural_failure" => Ok(DeadLetterReason::StructuralFailure),
            "conflict_error" => Ok(DeadLetterReason::ConflictError),
            "manual" => Ok(DeadLetterReason::Manual),
            other => {
                Err(TillSyncError::InvalidInput(format!("unknown dead-letter reason: {other}")))
            }
        }
    }
}

/// A queued outbound (or inbound) mutation.
///
/// The payload is opaque serialized data owned by the caller; the engine
/// never inspects it. All timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    /// Tenant scope; every read and write is filtered by this.
    pub store_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub direction: SyncDirection,
    pub payload: String,
    pub status: QueueItemStatus,
    pub attempt_count: u32,
    /// Item is eligible for dispatch only when `now >= next_attempt_at`.
    pub next_attempt_at: i64,
    pub error_category: Option<ErrorCategory>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QueueItem {
    /// Create a new pending item, eligible for dispatch immediately.
    pub fn new(
        store_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: SyncOperation,
        direction: SyncDirection,
        payload: impl Into<String>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            store_id: store_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            direction,
            payload: payload.into(),
            status: QueueItemStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            error_category: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Override the generated id (test/replay use).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// An item removed from active retry consideration, retained for inspection
/// and manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub store_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub direction: SyncDirection,
    pub payload: String,
    pub attempt_count: u32,
    pub error_category: ErrorCategory,
    pub reason: DeadLetterReason,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub failed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_starts_pending_with_zero_attempts() {
        let item = QueueItem::new(
            "store-1",
            "pack",
            "pack-42",
            SyncOperation::Create,
            SyncDirection::Push,
            "{}",
        );
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempt_count, 0);
        assert!(item.next_attempt_at <= Utc::now().timestamp_millis());
        assert!(item.error_category.is_none());
    }

    #[test]
    fn operation_round_trips_through_str() {
        for op in [
            SyncOperation::Create,
            SyncOperation::Update,
            SyncOperation::Delete,
            SyncOperation::Activate,
        ] {
            assert_eq!(op.to_string().parse::<SyncOperation>().unwrap(), op);
        }
        assert!("upsert".parse::<SyncOperation>().is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            QueueItemStatus::Pending,
            QueueItemStatus::Syncing,
            QueueItemStatus::Failed,
            QueueItemStatus::DeadLettered,
        ] {
            assert_eq!(status.to_string().parse::<QueueItemStatus>().unwrap(), status);
        }
    }

    #[test]
    fn category_and_reason_round_trip() {
        assert_eq!("conflict".parse::<ErrorCategory>().unwrap(), ErrorCategory::Conflict);
        assert_eq!(
            "max_attempts_exceeded".parse::<DeadLetterReason>().unwrap(),
            DeadLetterReason::MaxAttemptsExceeded
        );
        assert!("gone".parse::<DeadLetterReason>().is_err());
    }
}
