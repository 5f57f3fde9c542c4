//! Process-wide sync counters.
//!
//! One `SyncStats` is created at startup and handed out as `Arc<SyncStats>` to
//! the head syncer (head cursor writer), the worker pool (job counters) and
//! the status endpoint (reader). Every field is an atomic.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Shared counters for the head cursor and worker pool activity.
#[derive(Debug, Default)]
pub struct SyncStats {
    head_cursor: AtomicU64,
    submitted: AtomicU64,
    queued: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`], as served by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub head_cursor: u64,
    pub pool_submitted: u64,
    pub pool_queued: u64,
    pub pool_running: u64,
    /// Finished jobs, successful or not.
    pub pool_completed: u64,
    pub pool_failed: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the head cursor. Lower values replace higher ones: the cursor
    /// is "latest seen", not "maximum seen".
    pub fn update_head_cursor(&self, block_number: u64) {
        self.head_cursor.store(block_number, Ordering::SeqCst);
    }

    pub fn head_cursor(&self) -> u64 {
        self.head_cursor.load(Ordering::SeqCst)
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo `record_submitted` for a job the queue refused.
    pub(crate) fn record_rejected(&self) {
        saturating_decrement(&self.submitted);
        saturating_decrement(&self.queued);
    }

    pub(crate) fn record_started(&self) {
        saturating_decrement(&self.queued);
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finished(&self, success: bool) {
        saturating_decrement(&self.running);
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queued jobs dropped by a pool shutdown.
    pub(crate) fn record_discarded(&self, count: u64) {
        let _ = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |q| {
                Some(q.saturating_sub(count))
            });
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> u64 {
        self.running.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            head_cursor: self.head_cursor(),
            pool_submitted: self.submitted.load(Ordering::Relaxed),
            pool_queued: self.queued.load(Ordering::Relaxed),
            pool_running: self.running.load(Ordering::Relaxed),
            pool_completed: self.completed.load(Ordering::Relaxed),
            pool_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

fn saturating_decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
}

/// Spawn a task that logs a stats snapshot every `interval` until `shutdown`.
pub fn spawn_stats_reporter(
    stats: Arc<SyncStats>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_completed = stats.completed();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("stats reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = stats.snapshot();
                    tracing::info!(
                        head = snapshot.head_cursor,
                        queued = snapshot.pool_queued,
                        running = snapshot.pool_running,
                        completed = snapshot.pool_completed,
                        failed = snapshot.pool_failed,
                        since_last = snapshot.pool_completed.saturating_sub(last_completed),
                        "sync stats"
                    );
                    last_completed = snapshot.pool_completed;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_cursor_is_latest_seen() {
        let stats = SyncStats::new();
        stats.update_head_cursor(100);
        stats.update_head_cursor(98);
        assert_eq!(stats.head_cursor(), 98);
    }

    #[test]
    fn job_lifecycle_counters() {
        let stats = SyncStats::new();
        stats.record_submitted();
        stats.record_submitted();
        stats.record_submitted();
        stats.record_started();
        stats.record_started();
        stats.record_finished(true);
        stats.record_finished(false);

        let snap = stats.snapshot();
        assert_eq!(snap.pool_submitted, 3);
        assert_eq!(snap.pool_queued, 1);
        assert_eq!(snap.pool_running, 0);
        assert_eq!(snap.pool_completed, 2);
        assert_eq!(snap.pool_failed, 1);

        stats.record_discarded(5);
        assert_eq!(stats.queued(), 0);
    }

    #[test]
    fn snapshot_serializes_for_status_endpoint() {
        let stats = SyncStats::new();
        stats.update_head_cursor(7);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["head_cursor"], 7);
        assert_eq!(json["pool_queued"], 0);
    }

    #[tokio::test]
    async fn reporter_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = spawn_stats_reporter(
            Arc::new(SyncStats::new()),
            shutdown.clone(),
            Duration::from_millis(10),
        );
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop promptly")
            .expect("task should not panic");
    }
}
