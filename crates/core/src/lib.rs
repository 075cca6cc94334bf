//! # TillSync Core
//!
//! Pure sync-engine logic - no infrastructure dependencies.
//!
//! This crate contains:
//! - Port/adapter interfaces (traits) for storage, transport, and events
//! - Retry policy and circuit breaker
//! - The dispatcher tick and the metrics collector
//!
//! ## Architecture Principles
//! - Only depends on `tillsync-domain`
//! - No database, HTTP, or platform code
//! - All external dependencies via traits
//! - Pure, testable business logic

pub mod sync;

// Re-export specific items to avoid ambiguity
pub use sync::circuit_breaker::{CircuitBreaker, Clock, MockClock, SystemClock};
pub use sync::dispatcher::{Dispatcher, TickReport};
pub use sync::metrics::MetricsCollector;
pub use sync::ports::{
    DeadLetterStore, EventSink, FailureOutcome, NullEventSink, QueueStore, RemoteSendClient,
    SendFailure,
};
pub use sync::retry::{RetryDecision, RetryPolicy};
