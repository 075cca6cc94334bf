//! Domain types for the sync engine
//!
//! Organized into submodules by concern. Re-exported at the crate root for
//! convenient importing.

pub mod breaker;
pub mod metrics;
pub mod queue;
pub mod stats;

pub use breaker::*;
pub use metrics::*;
pub use queue::*;
pub use stats::*;
