//! HTTP adapters.

pub mod send_client;
