//! # TillSync Infra
//!
//! Infrastructure adapters for the TillSync sync engine.
//!
//! This crate contains:
//! - SQLite-backed queue and dead-letter stores
//! - HTTP remote send client
//! - Background workers (dispatch loop, metrics collection)
//! - Configuration loading and the engine composition root
//!
//! ## Architecture
//! - Implements the port traits defined in `tillsync-core`
//! - All blocking database work runs on the blocking thread pool

pub mod config;
pub mod database;
pub mod errors;
pub mod http;
pub mod observability;
pub mod sync;

pub use config::loader::load_config;
pub use database::dead_letter_repository::SqliteDeadLetterStore;
pub use database::manager::DbManager;
pub use database::queue_repository::SqliteQueueStore;
pub use errors::{InfraError, WorkerError};
pub use http::send_client::HttpSendClient;
pub use observability::event_sink::TracingEventSink;
pub use sync::engine::SyncEngine;
pub use sync::metrics_worker::MetricsWorker;
pub use sync::worker::SyncWorker;
