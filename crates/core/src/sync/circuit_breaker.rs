//! Circuit breaker guarding the remote send path.
//!
//! Counts failures over a sliding window; trips open once the threshold is
//! reached, fast-failing until a reset timeout elapses, then admits a
//! limited number of probes. Repeated probe failures back the reset timeout
//! off exponentially up to a cap.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tillsync_domain::{BreakerConfig, CircuitBreakerSnapshot, CircuitState};
use tracing::{debug, info, warn};

/// Time source, injectable so breaker transitions are testable without
/// sleeping.
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct MockClock {
    now_ms: Mutex<i64>,
}

impl MockClock {
    pub fn new(start_ms: i64) -> Self {
        Self { now_ms: Mutex::new(start_ms) }
    }

    pub fn advance(&self, delta_ms: i64) {
        *self.now_ms.lock() += delta_ms;
    }

    pub fn set(&self, now_ms: i64) {
        *self.now_ms.lock() = now_ms;
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        *self.now_ms.lock()
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Epoch-ms timestamps of failures still inside the window.
    failures: VecDeque<i64>,
    /// When an open breaker starts admitting probes.
    open_until: i64,
    /// Reset timeout applied on the most recent trip, after backoff.
    current_reset_timeout_ms: u64,
    half_open_successes: u32,
    in_flight_probes: u32,
    total_trips: u64,
}

/// Shared, thread-safe circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("state", &self.state()).finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let reset_timeout_ms = config.reset_timeout_ms;
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                open_until: 0,
                current_reset_timeout_ms: reset_timeout_ms,
                half_open_successes: 0,
                in_flight_probes: 0,
                total_trips: 0,
            }),
        }
    }

    /// Whether a request may proceed. Transitions open → half-open when the
    /// reset deadline has passed, and counts the admitted probe.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now >= inner.open_until {
                    info!(target: "tillsync::breaker", "circuit breaker entering half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.in_flight_probes = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.in_flight_probes < self.config.half_open_max_probes {
                    inner.in_flight_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                let cutoff = self.clock.now_ms() - self.config.failure_window_ms as i64;
                Self::prune_failures(&mut inner.failures, cutoff);
            }
            CircuitState::HalfOpen => {
                inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    info!(target: "tillsync::breaker", "circuit breaker closed after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.half_open_successes = 0;
                    inner.in_flight_probes = 0;
                    inner.current_reset_timeout_ms = self.config.reset_timeout_ms;
                }
            }
            // A late success from before the trip; nothing to adjust.
            CircuitState::Open => {}
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                let cutoff = now - self.config.failure_window_ms as i64;
                Self::prune_failures(&mut inner.failures, cutoff);
                inner.failures.push_back(now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    let timeout = inner.current_reset_timeout_ms;
                    warn!(
                        target: "tillsync::breaker",
                        failures = inner.failures.len(),
                        reset_timeout_ms = timeout,
                        "circuit breaker tripped open"
                    );
                    inner.state = CircuitState::Open;
                    inner.open_until = now + timeout as i64;
                    inner.total_trips += 1;
                }
            }
            CircuitState::HalfOpen => {
                // A failed probe reopens with a longer timeout.
                let backed_off = (inner.current_reset_timeout_ms as f64
                    * self.config.reset_backoff_multiplier)
                    as u64;
                inner.current_reset_timeout_ms =
                    backed_off.min(self.config.max_reset_timeout_ms);
                warn!(
                    target: "tillsync::breaker",
                    reset_timeout_ms = inner.current_reset_timeout_ms,
                    "probe failed, circuit breaker reopened"
                );
                inner.state = CircuitState::Open;
                inner.open_until = now + inner.current_reset_timeout_ms as i64;
                inner.half_open_successes = 0;
                inner.in_flight_probes = 0;
                inner.total_trips += 1;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Point-in-time view for persistence and metrics.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        let cutoff = now - self.config.failure_window_ms as i64;
        let failures_in_window =
            inner.failures.iter().filter(|&&ts| ts > cutoff).count() as u32;
        CircuitBreakerSnapshot {
            state: inner.state,
            failures_in_window,
            open_until: (inner.state == CircuitState::Open).then_some(inner.open_until),
            current_reset_timeout_ms: inner.current_reset_timeout_ms,
            half_open_successes: inner.half_open_successes,
            total_trips: inner.total_trips,
        }
    }

    /// Restore state saved by a previous process.
    ///
    /// A snapshot taken half-open is restored as open with the current reset
    /// timeout; in-flight probes did not survive the restart.
    pub fn restore(&self, snapshot: &CircuitBreakerSnapshot) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.current_reset_timeout_ms = snapshot
            .current_reset_timeout_ms
            .clamp(self.config.reset_timeout_ms, self.config.max_reset_timeout_ms);
        inner.half_open_successes = 0;
        inner.in_flight_probes = 0;
        inner.total_trips = snapshot.total_trips;
        inner.failures.clear();
        match snapshot.state {
            CircuitState::Closed => {
                inner.state = CircuitState::Closed;
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.open_until = snapshot
                    .open_until
                    .unwrap_or(now + inner.current_reset_timeout_ms as i64);
            }
        }
        debug!(target: "tillsync::breaker", state = %inner.state, "circuit breaker state restored");
    }

    /// Force a specific state (operator tooling and tests).
    ///
    /// Forcing open counts as a trip and uses the current reset timeout for
    /// the deadline; forcing closed clears the failure window but keeps the
    /// trip counter.
    pub fn force_state(&self, state: CircuitState) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        if state == CircuitState::Open && inner.state != CircuitState::Open {
            inner.total_trips += 1;
        }
        inner.failures.clear();
        inner.half_open_successes = 0;
        inner.in_flight_probes = 0;
        inner.state = state;
        if state == CircuitState::Open {
            inner.open_until = now + inner.current_reset_timeout_ms as i64;
        }
        warn!(target: "tillsync::breaker", state = %state, "circuit breaker state forced");
    }

    /// Force the breaker back to closed, clearing all history including the
    /// trip counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.open_until = 0;
        inner.half_open_successes = 0;
        inner.in_flight_probes = 0;
        inner.current_reset_timeout_ms = self.config.reset_timeout_ms;
        inner.total_trips = 0;
    }

    fn prune_failures(failures: &mut VecDeque<i64>, cutoff: i64) {
        while failures.front().is_some_and(|&ts| ts <= cutoff) {
            failures.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window_ms: 60_000,
            reset_timeout_ms: 30_000,
            reset_backoff_multiplier: 2.0,
            max_reset_timeout_ms: 120_000,
            half_open_success_threshold: 2,
            half_open_max_probes: 2,
        }
    }

    fn breaker() -> (CircuitBreaker, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(1_000_000));
        (CircuitBreaker::with_clock(config(), clock.clone()), clock)
    }

    #[test]
    fn starts_closed_and_allows_execution() {
        let (breaker, _clock) = breaker();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn trips_open_at_failure_threshold() {
        let (breaker, _clock) = breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.snapshot().total_trips, 1);
    }

    #[test]
    fn failures_outside_window_do_not_trip() {
        let (breaker, clock) = breaker();
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(61_000);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn enters_half_open_after_reset_timeout() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.can_execute());
        clock.advance(30_000);
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(30_000);
        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());
    }

    #[test]
    fn closes_after_enough_probe_successes() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(30_000);
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        // Reset timeout returns to its base value after closing.
        assert_eq!(breaker.snapshot().current_reset_timeout_ms, 30_000);
    }

    #[test]
    fn failed_probe_reopens_with_backed_off_timeout() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(30_000);
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        let snap = breaker.snapshot();
        assert_eq!(snap.current_reset_timeout_ms, 60_000);
        assert_eq!(snap.total_trips, 2);
        // Not yet past the longer deadline.
        clock.advance(30_000);
        assert!(!breaker.can_execute());
        clock.advance(30_000);
        assert!(breaker.can_execute());
    }

    #[test]
    fn backoff_caps_at_configured_maximum() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        for _ in 0..4 {
            clock.advance(200_000);
            assert!(breaker.can_execute());
            breaker.record_failure();
        }
        assert_eq!(breaker.snapshot().current_reset_timeout_ms, 120_000);
    }

    #[test]
    fn restore_reconstructs_open_state() {
        let (breaker, clock) = breaker();
        let snapshot = CircuitBreakerSnapshot {
            state: CircuitState::Open,
            failures_in_window: 3,
            open_until: Some(clock.now_ms() + 10_000),
            current_reset_timeout_ms: 60_000,
            half_open_successes: 0,
            total_trips: 4,
        };
        breaker.restore(&snapshot);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        clock.advance(10_000);
        assert!(breaker.can_execute());
        assert_eq!(breaker.snapshot().total_trips, 4);
    }

    #[test]
    fn restore_downgrades_half_open_to_open() {
        let (breaker, clock) = breaker();
        let snapshot = CircuitBreakerSnapshot {
            state: CircuitState::HalfOpen,
            failures_in_window: 0,
            open_until: None,
            current_reset_timeout_ms: 30_000,
            half_open_successes: 1,
            total_trips: 1,
        };
        breaker.restore(&snapshot);
        assert_eq!(breaker.state(), CircuitState::Open);
        clock.advance(30_000);
        assert!(breaker.can_execute());
    }

    #[test]
    fn forced_open_rejects_until_deadline() {
        let (breaker, clock) = breaker();
        breaker.force_state(CircuitState::Open);
        assert_eq!(breaker.snapshot().total_trips, 1);
        assert!(!breaker.can_execute());
        clock.advance(30_000);
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn forcing_open_twice_counts_one_trip() {
        let (breaker, _clock) = breaker();
        breaker.force_state(CircuitState::Open);
        breaker.force_state(CircuitState::Open);
        assert_eq!(breaker.snapshot().total_trips, 1);
    }

    #[test]
    fn reset_returns_to_pristine_closed() {
        let (breaker, _clock) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
        assert_eq!(breaker.snapshot().failures_in_window, 0);
    }

    #[test]
    fn reset_clears_the_trip_counter() {
        let (breaker, _clock) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.snapshot().total_trips, 1);
        breaker.reset();
        let snap = breaker.snapshot();
        assert_eq!(snap.total_trips, 0);
        assert_eq!(snap.open_until, None);
    }
}
