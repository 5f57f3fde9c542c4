//! Engine configuration.
//!
//! Durations are carried as integer `_ms`/`_secs` fields so the structs map
//! one-to-one onto the `[syncer]` TOML section.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::error::SyncError;

/// Worker pool sizing and per-job deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub pool_size: usize,
    /// Jobs that may wait in the queue before `submit` blocks.
    pub queue_capacity: usize,
    /// Deadline for a single pipeline run, measured from when it starts.
    pub job_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            queue_capacity: 1024,
            job_timeout_secs: 15,
        }
    }
}

impl PoolConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

/// Resubscription behaviour of the head syncer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadSyncerConfig {
    pub resubscribe_backoff_ms: u64,
    pub resubscribe_backoff_max_ms: u64,
    /// Consecutive failed subscribe attempts before giving up.
    /// `None` (the default) retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_resubscribe_attempts: Option<u32>,
}

impl Default for HeadSyncerConfig {
    fn default() -> Self {
        Self {
            resubscribe_backoff_ms: 2_000,
            resubscribe_backoff_max_ms: 30_000,
            max_resubscribe_attempts: None,
        }
    }
}

impl HeadSyncerConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.resubscribe_backoff_ms),
            max: Duration::from_millis(self.resubscribe_backoff_max_ms),
            multiplier: 2.0,
            max_attempts: self.max_resubscribe_attempts,
        }
    }
}

/// Gap sweep parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    /// Largest number of blocks submitted per batch.
    pub batch_size: u64,
    /// Blocks behind the head cursor that are left to the live syncer.
    pub head_block_lag: u64,
    pub sweep_interval_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            head_block_lag: 5,
            sweep_interval_secs: 10,
        }
    }
}

impl JanitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Everything the [`SyncEngine`](crate::engine::SyncEngine) needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(flatten)]
    pub pool: PoolConfig,
    #[serde(flatten)]
    pub head: HeadSyncerConfig,
    #[serde(flatten)]
    pub janitor: JanitorConfig,
    /// Committed into an empty store so backfill starts at `lower_bound + 1`.
    pub initial_lower_bound: u64,
    pub stats_log_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            head: HeadSyncerConfig::default(),
            janitor: JanitorConfig::default(),
            initial_lower_bound: 0,
            stats_log_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_secs(self.stats_log_interval_secs)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        let checks: [(&str, bool); 7] = [
            ("pool_size", self.pool.pool_size == 0),
            ("queue_capacity", self.pool.queue_capacity == 0),
            ("job_timeout_secs", self.pool.job_timeout_secs == 0),
            ("batch_size", self.janitor.batch_size == 0),
            ("sweep_interval_secs", self.janitor.sweep_interval_secs == 0),
            ("resubscribe_backoff_ms", self.head.resubscribe_backoff_ms == 0),
            ("stats_log_interval_secs", self.stats_log_interval_secs == 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, bad)| *bad) {
            return Err(SyncError::Config(format!("{field} must be greater than zero")));
        }
        if self.head.resubscribe_backoff_max_ms < self.head.resubscribe_backoff_ms {
            return Err(SyncError::Config(
                "resubscribe_backoff_max_ms must not be below resubscribe_backoff_ms".into(),
            ));
        }
        if self.head.max_resubscribe_attempts == Some(0) {
            return Err(SyncError::Config(
                "max_resubscribe_attempts must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}
