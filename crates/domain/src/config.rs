//! Configuration structures for the sync engine.
//!
//! Every section carries serde defaults so a config file only needs to name
//! the values it overrides. `SyncConfig::validate` is called once at engine
//! construction; workers assume a validated config afterwards.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TillSyncError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Tenant this engine instance serves.
    pub store_id: String,
    /// Base URL of the remote sync endpoint.
    pub remote_url: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub slo: SloConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.store_id.trim().is_empty() {
            return Err(TillSyncError::Config("store_id must not be empty".into()));
        }
        if self.remote_url.trim().is_empty() {
            return Err(TillSyncError::Config("remote_url must not be empty".into()));
        }
        self.database.validate()?;
        self.dispatcher.validate()?;
        self.retry.validate()?;
        self.breaker.validate()?;
        self.slo.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

/// SQLite storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the database file. `:memory:` is accepted for tests.
    pub path: PathBuf,
    /// Connection pool size.
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("tillsync.db"), pool_size: 4 }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(TillSyncError::Config("pool_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Dispatch loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum items claimed per tick.
    pub batch_size: usize,
    /// Delay between ticks when the queue is drained.
    pub poll_interval_secs: u64,
    /// Hard ceiling on a single tick; a stuck remote cannot wedge the loop.
    pub tick_timeout_secs: u64,
    /// Claims older than this are considered abandoned and reclaimed.
    pub stuck_claim_timeout_secs: u64,
    /// How long `stop()` waits for the loop task to finish.
    pub join_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval_secs: 30,
            tick_timeout_secs: 300,
            stuck_claim_timeout_secs: 300,
            join_timeout_secs: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TillSyncError::Config("batch_size must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(TillSyncError::Config("poll_interval_secs must be at least 1".into()));
        }
        if self.tick_timeout_secs == 0 {
            return Err(TillSyncError::Config("tick_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt ceiling for transient failures.
    pub max_attempts: u32,
    /// Tighter ceiling for unclassified failures.
    pub unknown_max_attempts: u32,
    /// First retry delay; doubles each attempt.
    pub base_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
    /// Random jitter as a fraction of the computed delay, 0.0..=1.0.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            unknown_max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 || self.unknown_max_attempts == 0 {
            return Err(TillSyncError::Config("attempt ceilings must be at least 1".into()));
        }
        if self.base_delay_ms == 0 {
            return Err(TillSyncError::Config("base_delay_ms must be at least 1".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(TillSyncError::Config("max_delay_ms must be >= base_delay_ms".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(TillSyncError::Config("jitter_factor must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted.
    pub failure_window_ms: u64,
    /// Initial open duration before probing starts.
    pub reset_timeout_ms: u64,
    /// Open duration multiplier applied when a probe fails.
    pub reset_backoff_multiplier: f64,
    /// Ceiling on the backed-off open duration.
    pub max_reset_timeout_ms: u64,
    /// Consecutive probe successes required to close from half-open.
    pub half_open_success_threshold: u32,
    /// Concurrent probe limit while half-open.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            reset_timeout_ms: 30_000,
            reset_backoff_multiplier: 2.0,
            max_reset_timeout_ms: 600_000,
            half_open_success_threshold: 2,
            half_open_max_probes: 3,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(TillSyncError::Config("failure_threshold must be at least 1".into()));
        }
        if self.failure_window_ms == 0 || self.reset_timeout_ms == 0 {
            return Err(TillSyncError::Config("breaker windows must be at least 1ms".into()));
        }
        if self.reset_backoff_multiplier < 1.0 {
            return Err(TillSyncError::Config("reset_backoff_multiplier must be >= 1.0".into()));
        }
        if self.max_reset_timeout_ms < self.reset_timeout_ms {
            return Err(TillSyncError::Config(
                "max_reset_timeout_ms must be >= reset_timeout_ms".into(),
            ));
        }
        if self.half_open_success_threshold == 0 || self.half_open_max_probes == 0 {
            return Err(TillSyncError::Config("half-open thresholds must be at least 1".into()));
        }
        Ok(())
    }
}

/// Service level objective targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SloConfig {
    /// Target for end-to-end item latency.
    pub p99_latency_target_ms: u64,
    /// Live queue depth above which the engine is in backpressure.
    pub queue_depth_target: u64,
    /// Maximum acceptable dead-letter share of completed items, 0.0..=1.0.
    pub error_rate_target: f64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self { p99_latency_target_ms: 2_000, queue_depth_target: 1_000, error_rate_target: 0.05 }
    }
}

impl SloConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth_target == 0 {
            return Err(TillSyncError::Config("queue_depth_target must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.error_rate_target) {
            return Err(TillSyncError::Config("error_rate_target must be within 0.0..=1.0".into()));
        }
        Ok(())
    }

    /// Merge a partial update, keeping current values where the update is
    /// silent.
    pub fn apply(&mut self, update: &SloConfigUpdate) {
        if let Some(v) = update.p99_latency_target_ms {
            self.p99_latency_target_ms = v;
        }
        if let Some(v) = update.queue_depth_target {
            self.queue_depth_target = v;
        }
        if let Some(v) = update.error_rate_target {
            self.error_rate_target = v;
        }
    }
}

/// Partial SLO override, applied at runtime without restarting workers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SloConfigUpdate {
    pub p99_latency_target_ms: Option<u64>,
    pub queue_depth_target: Option<u64>,
    pub error_rate_target: Option<f64>,
}

/// Metrics collection settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Delay between collection cycles.
    pub collection_interval_secs: u64,
    /// Snapshots retained in memory; 1440 covers 24h at the default
    /// interval.
    pub history_cap: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { collection_interval_secs: 60, history_cap: 1_440 }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.collection_interval_secs == 0 {
            return Err(TillSyncError::Config(
                "collection_interval_secs must be at least 1".into(),
            ));
        }
        if self.history_cap == 0 {
            return Err(TillSyncError::Config("history_cap must be at least 1".into()));
        }
        Ok(())
    }
}
