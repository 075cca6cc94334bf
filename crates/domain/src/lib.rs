//! # TillSync Domain
//!
//! Business domain types and models for the TillSync sync engine.
//!
//! This crate contains:
//! - Queue item model and lifecycle enums
//! - Metric snapshot and SLO report types
//! - Configuration structures
//! - Domain error types and Result definitions
//!
//! ## Architecture
//! - No dependencies on other TillSync crates
//! - Only external dependencies allowed
//! - Pure domain models and data structures

pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
