//! Capped exponential backoff used by the head syncer's resubscribe loop.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for the backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Ceiling for the delay.
    pub max: Duration,
    /// Multiplier applied after every failed attempt.
    pub multiplier: f64,
    /// Give up once this many consecutive attempts have failed. `None`
    /// retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Stateless policy: computes the delay for a given attempt number.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay to wait after `attempt` consecutive failures (1-based), or `None`
    /// once `max_attempts` failures have been seen.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.should_retry(attempt).then(|| self.delay_for(attempt))
    }

    /// Delay after `attempt` failures, ignoring `max_attempts`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.initial.as_millis() as f64 * self.config.multiplier.powi(exp);
        let cap_ms = self.config.max.as_millis() as f64;
        Duration::from_millis(base_ms.min(cap_ms) as u64)
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.config
            .max_attempts
            .map(|max| attempt < max)
            .unwrap_or(true)
    }
}

/// Sleep for `delay` unless `shutdown` fires first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
