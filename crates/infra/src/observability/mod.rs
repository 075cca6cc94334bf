//! Observability adapters.

pub mod event_sink;
