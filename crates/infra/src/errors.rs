//! Infrastructure error types and conversions into the domain error.

use thiserror::Error;
use tillsync_domain::TillSyncError;

/// Errors raised by infrastructure adapters before conversion to the
/// domain error.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("blocking task failed: {0}")]
    TaskJoin(String),
}

impl From<InfraError> for TillSyncError {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::Sqlite(e) => TillSyncError::Database(e.to_string()),
            InfraError::Pool(e) => TillSyncError::Database(e.to_string()),
            InfraError::TaskJoin(msg) => TillSyncError::Internal(msg),
        }
    }
}

/// Convert a rusqlite error into the domain error.
pub(crate) fn map_sql_error(err: rusqlite::Error) -> TillSyncError {
    TillSyncError::from(InfraError::from(err))
}

/// Convert a join error from `spawn_blocking` into the domain error.
pub(crate) fn map_join_error(err: tokio::task::JoinError) -> TillSyncError {
    TillSyncError::from(InfraError::TaskJoin(err.to_string()))
}

/// Lifecycle errors shared by the background workers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker already running: {0}")]
    AlreadyRunning(&'static str),

    #[error("worker not running: {0}")]
    NotRunning(&'static str),

    #[error("worker did not stop within {timeout_secs}s: {name}")]
    JoinTimeout { name: &'static str, timeout_secs: u64 },
}

impl From<WorkerError> for TillSyncError {
    fn from(err: WorkerError) -> Self {
        TillSyncError::Internal(err.to_string())
    }
}
