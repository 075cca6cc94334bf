//! Sync engine logic: ports, retry policy, circuit breaker, dispatch, and
//! metrics collection.

pub mod circuit_breaker;
pub mod dispatcher;
pub mod metrics;
pub mod ports;
pub mod retry;
