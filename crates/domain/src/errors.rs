//! Error types used throughout the sync engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for TillSync
#[derive(Error, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum TillSyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for TillSync operations
pub type Result<T> = std::result::Result<T, TillSyncError>;
