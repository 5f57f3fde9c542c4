//! Gap sweeper.
//!
//! Every `sweep_interval` the janitor compares the lagged head cursor with the
//! store's committed watermark and submits one batch of the blocks in between
//! that the store reports as missing, lowest first. Blocks missed by the live
//! subscription, or whose jobs failed, are picked up here. A tick is skipped
//! while the pool still has queued jobs.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::JanitorConfig;
use crate::error::SyncError;
use crate::pool::{Job, WorkerPool};
use crate::stats::SyncStats;
use crate::store::Store;

/// Outcome of a single sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// `head - lag`, or `None` while the head is below the lag.
    pub target: Option<u64>,
    pub last_committed: Option<u64>,
    /// The pool had queued jobs, so the store was not consulted.
    pub skipped: bool,
    /// Block numbers handed to the pool, ascending.
    pub submitted: Vec<u64>,
}

/// The gap `(last_committed, target]`, or `None` when there is none. An empty
/// store (`None`) starts at block 0.
pub fn sweep_window(last_committed: Option<u64>, target: u64) -> Option<RangeInclusive<u64>> {
    match last_committed {
        Some(last) if last >= target => None,
        Some(last) => Some(last + 1..=target),
        None => Some(0..=target),
    }
}

pub struct Janitor {
    pool: Arc<WorkerPool>,
    store: Arc<dyn Store>,
    stats: Arc<SyncStats>,
    batch_size: u64,
    head_block_lag: u64,
    sweep_interval: Duration,
}

impl Janitor {
    pub fn new(
        pool: Arc<WorkerPool>,
        store: Arc<dyn Store>,
        stats: Arc<SyncStats>,
        config: &JanitorConfig,
    ) -> Self {
        Self {
            pool,
            store,
            stats,
            batch_size: config.batch_size.max(1),
            head_block_lag: config.head_block_lag,
            sweep_interval: config.sweep_interval(),
        }
    }

    /// Override the sweep period (sub-second periods are only useful in tests).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sweep every `sweep_interval` until `shutdown` is cancelled. A failed
    /// sweep is logged and retried on the next tick.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), SyncError> {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.sweep_interval,
            self.sweep_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.sweep_interval.as_millis() as u64,
            batch_size = self.batch_size,
            lag = self.head_block_lag,
            "janitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep(&shutdown).await {
                Ok(report) if report.skipped => tracing::debug!(
                    queued = self.stats.queued(),
                    "janitor waiting for the queue to drain"
                ),
                Ok(report) if !report.submitted.is_empty() => tracing::info!(
                    sweep_target = report.target,
                    last_committed = report.last_committed,
                    first = report.submitted.first(),
                    last = report.submitted.last(),
                    submitted = report.submitted.len(),
                    "janitor backfilled gap"
                ),
                Ok(report) => tracing::debug!(
                    sweep_target = report.target,
                    last_committed = report.last_committed,
                    "janitor found no gap"
                ),
                Err(SyncError::PoolStopped) => return Err(SyncError::PoolStopped),
                Err(e) => tracing::error!(error = %e, "janitor sweep failed"),
            }
        }

        tracing::info!("janitor stopped");
        Ok(())
    }

    /// Run one sweep: submit up to `batch_size` missing blocks from the bottom
    /// of the gap. Returns early, with what was submitted so far, if
    /// `shutdown` fires while waiting on a full queue.
    pub async fn sweep(&self, shutdown: &CancellationToken) -> Result<SweepReport, SyncError> {
        let mut report = SweepReport {
            target: self.stats.head_cursor().checked_sub(self.head_block_lag),
            ..Default::default()
        };
        let Some(target) = report.target else {
            return Ok(report);
        };
        if self.stats.queued() > 0 {
            report.skipped = true;
            return Ok(report);
        }

        report.last_committed = self.store.highest_committed_block().await?;
        let Some(window) = sweep_window(report.last_committed, target) else {
            return Ok(report);
        };

        let limit = usize::try_from(self.batch_size).unwrap_or(usize::MAX);
        let missing = self.store.missing_blocks(window.clone(), limit).await?;
        tracing::debug!(
            from = window.start(),
            to = window.end(),
            missing = missing.len(),
            "janitor submitting batch"
        );
        for block_number in missing {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(report),
                submitted = self.pool.submit(Job::janitor(block_number)) => submitted?,
            }
            report.submitted.push(block_number);
        }
        Ok(report)
    }
}

impl std::fmt::Debug for Janitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Janitor")
            .field("batch_size", &self.batch_size)
            .field("head_block_lag", &self.head_block_lag)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}
