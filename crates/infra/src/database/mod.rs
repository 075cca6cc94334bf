//! SQLite persistence adapters.

pub mod dead_letter_repository;
pub mod manager;
pub mod queue_repository;
