//! Background workers and the engine composition root.

pub mod engine;
pub mod metrics_worker;
pub mod worker;
