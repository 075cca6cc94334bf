//! Retry policy: pure decision logic for failed delivery attempts.

use rand::Rng;
use tillsync_domain::{DeadLetterReason, ErrorCategory, RetryConfig};

/// What to do with an item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry { delay_ms: u64 },
    /// Stop retrying and move the item to the dead-letter store.
    DeadLetter { reason: DeadLetterReason },
}

/// Stateless retry policy.
///
/// Transient and unknown failures back off exponentially with jitter up to a
/// per-category attempt ceiling; permanent, structural, and conflict
/// failures dead-letter immediately since repeating the same request cannot
/// change the outcome.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide the fate of an item whose delivery just failed.
    /// `attempt_count` is the number of attempts made so far, including the
    /// one that just failed.
    pub fn decide(&self, attempt_count: u32, category: ErrorCategory) -> RetryDecision {
        match category {
            ErrorCategory::Permanent => {
                RetryDecision::DeadLetter { reason: DeadLetterReason::PermanentError }
            }
            ErrorCategory::Structural => {
                RetryDecision::DeadLetter { reason: DeadLetterReason::StructuralFailure }
            }
            ErrorCategory::Conflict => {
                RetryDecision::DeadLetter { reason: DeadLetterReason::ConflictError }
            }
            ErrorCategory::Transient | ErrorCategory::Unknown => {
                if attempt_count >= self.max_attempts_for(category) {
                    RetryDecision::DeadLetter { reason: DeadLetterReason::MaxAttemptsExceeded }
                } else {
                    RetryDecision::Retry { delay_ms: self.delay_with_jitter(attempt_count) }
                }
            }
        }
    }

    /// Attempt ceiling applied to the given category.
    pub fn max_attempts_for(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::Unknown => self.config.unknown_max_attempts,
            _ => self.config.max_attempts,
        }
    }

    /// Deterministic backoff before jitter: `base * 2^(attempt - 1)`, capped.
    pub fn base_delay_ms(&self, attempt_count: u32) -> u64 {
        // Exponent capped to avoid overflow on pathological attempt counts.
        let exponent = attempt_count.saturating_sub(1).min(20);
        let delay = self.config.base_delay_ms.saturating_mul(1u64 << exponent);
        delay.min(self.config.max_delay_ms)
    }

    fn delay_with_jitter(&self, attempt_count: u32) -> u64 {
        let base = self.base_delay_ms(attempt_count);
        if self.config.jitter_factor <= 0.0 {
            return base;
        }
        let spread = (base as f64 * self.config.jitter_factor) as u64;
        if spread == 0 {
            return base;
        }
        // Jitter spreads retries across [base - spread, base + spread] so
        // items failed by the same outage do not reconverge on one instant.
        // Floored at 1ms: a zero delay would make the item eligible on the
        // very tick that failed it.
        let offset = rand::thread_rng().gen_range(0..=spread * 2);
        base.saturating_sub(spread).saturating_add(offset).min(self.config.max_delay_ms).max(1)
    }
}
