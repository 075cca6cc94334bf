//! Configuration loading.

pub mod loader;
