//! Aggregate statistics returned by the queue and dead-letter stores.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Counts of live queue items broken down by dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items eligible for dispatch right now (pending, or failed with an
    /// elapsed retry deadline).
    pub pending: u64,
    /// Claimed items currently being sent.
    pub syncing: u64,
    /// Failed items waiting out a retry delay.
    pub backoff: u64,
    pub by_entity_type: HashMap<String, u64>,
    pub by_operation: HashMap<String, u64>,
    pub by_direction: HashMap<String, u64>,
}

impl QueueStats {
    /// Total live items, regardless of eligibility.
    pub fn total(&self) -> u64 {
        self.pending + self.syncing + self.backoff
    }
}

/// Aggregates over the dead-letter store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub by_reason: HashMap<String, u64>,
    pub by_entity_type: HashMap<String, u64>,
    pub by_error_category: HashMap<String, u64>,
    /// Epoch milliseconds of the earliest `failed_at`, if any entries exist.
    pub oldest_failed_at: Option<i64>,
    pub newest_failed_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_sums_all_live_buckets() {
        let stats = QueueStats { pending: 3, syncing: 2, backoff: 5, ..Default::default() };
        assert_eq!(stats.total(), 10);
    }

    #[test]
    fn empty_dead_letter_stats_have_no_timestamps() {
        let stats = DeadLetterStats::default();
        assert_eq!(stats.total, 0);
        assert!(stats.oldest_failed_at.is_none());
    }
}
