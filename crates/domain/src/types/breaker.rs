//! Circuit breaker state shared between the breaker itself, persistence,
//! and metric snapshots.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::TillSyncError;

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests flow through.
    Closed,
    /// Fast-fail; requests are rejected until the reset timeout elapses.
    Open,
    /// Probing; a limited number of trial requests are allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl FromStr for CircuitState {
    type Err = TillSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            other => Err(TillSyncError::InvalidInput(format!("unknown circuit state: {other}"))),
        }
    }
}

/// Point-in-time view of a breaker, used for persistence across restarts
/// and for embedding in metric snapshots. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    /// Failures currently inside the sliding window.
    pub failures_in_window: u32,
    /// When an open breaker will admit a probe; `None` unless open.
    pub open_until: Option<i64>,
    /// Reset timeout that will apply to the next trip, after backoff.
    pub current_reset_timeout_ms: u64,
    /// Consecutive successful probes while half-open.
    pub half_open_successes: u32,
    /// Times the breaker has tripped since construction (or restore).
    pub total_trips: u64,
}

impl CircuitBreakerSnapshot {
    /// Snapshot of a freshly constructed breaker.
    pub fn closed(reset_timeout_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failures_in_window: 0,
            open_until: None,
            current_reset_timeout_ms: reset_timeout_ms,
            half_open_successes: 0,
            total_trips: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(state.to_string().parse::<CircuitState>().unwrap(), state);
        }
        assert!("tripped".parse::<CircuitState>().is_err());
    }

    #[test]
    fn closed_snapshot_has_no_open_deadline() {
        let snap = CircuitBreakerSnapshot::closed(30_000);
        assert_eq!(snap.state, CircuitState::Closed);
        assert!(snap.open_until.is_none());
        assert_eq!(snap.current_reset_timeout_ms, 30_000);
        assert_eq!(snap.total_trips, 0);
    }
}
