//! Fixed-size worker pool over a bounded job queue.
//!
//! `pool_size` workers pull [`Job`]s from a shared mpsc queue of
//! `queue_capacity` slots. Every job runs its block through the
//! [`BlockProcessor`] under a deadline measured from the moment a worker picks
//! it up. Job outcomes are logged and counted here and never reach the
//! producer.

use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::SyncError;
use crate::pipeline::BlockProcessor;
use crate::stats::SyncStats;

/// Which producer asked for the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Head,
    Janitor,
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobSource::Head => f.write_str("head"),
            JobSource::Janitor => f.write_str("janitor"),
        }
    }
}

/// A request to process one block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub block_number: u64,
    pub source: JobSource,
}

impl Job {
    pub fn head(block_number: u64) -> Self {
        Self {
            block_number,
            source: JobSource::Head,
        }
    }

    pub fn janitor(block_number: u64) -> Self {
        Self {
            block_number,
            source: JobSource::Janitor,
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

/// Bounded pool shared by the head syncer and the janitor.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: SharedReceiver,
    capacity: usize,
    shutdown: CancellationToken,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SyncStats>,
}

impl WorkerPool {
    /// Spawn the workers. Must be called from within a Tokio runtime.
    pub fn start(
        config: &PoolConfig,
        processor: Arc<dyn BlockProcessor>,
        stats: Arc<SyncStats>,
    ) -> Self {
        Self::with_timeout(
            config.pool_size,
            config.queue_capacity,
            config.job_timeout(),
            processor,
            stats,
        )
    }

    pub fn with_timeout(
        pool_size: usize,
        queue_capacity: usize,
        job_timeout: Duration,
        processor: Arc<dyn BlockProcessor>,
        stats: Arc<SyncStats>,
    ) -> Self {
        let pool_size = pool_size.max(1);
        let capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let workers = (0..pool_size)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    receiver.clone(),
                    shutdown.clone(),
                    processor.clone(),
                    stats.clone(),
                    job_timeout,
                ))
            })
            .collect();

        tracing::info!(
            workers = pool_size,
            queue_capacity = capacity,
            job_timeout_ms = job_timeout.as_millis() as u64,
            "worker pool started"
        );

        Self {
            sender: Mutex::new(Some(tx)),
            receiver,
            capacity,
            shutdown,
            workers: tokio::sync::Mutex::new(workers),
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, SyncError> {
        self.sender
            .lock()
            .map_err(|_| SyncError::Other("worker pool sender lock poisoned".into()))?
            .clone()
            .ok_or(SyncError::PoolStopped)
    }

    /// Enqueue a job, waiting for a free slot while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), SyncError> {
        let sender = self.sender()?;
        self.stats.record_submitted();
        if sender.send(job).await.is_err() {
            self.stats.record_rejected();
            return Err(SyncError::PoolStopped);
        }
        Ok(())
    }

    /// Enqueue a job without waiting. A full queue rejects the job.
    pub fn try_submit(&self, job: Job) -> Result<(), SyncError> {
        let sender = self.sender()?;
        self.stats.record_submitted();
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.stats.record_rejected();
                tracing::warn!(
                    block = job.block_number,
                    source = %job.source,
                    capacity = self.capacity,
                    "worker pool queue full, job rejected"
                );
                Err(SyncError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.record_rejected();
                Err(SyncError::PoolStopped)
            }
        }
    }

    /// Stop accepting work, drop whatever is still queued and wait for the
    /// jobs that are already running. Safe to call more than once.
    pub async fn stop(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        self.shutdown.cancel();

        let discarded = {
            let mut rx = self.receiver.lock().await;
            rx.close();
            let mut count = 0u64;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            count
        };
        if discarded > 0 {
            self.stats.record_discarded(discarded);
            tracing::warn!(discarded, "worker pool stopped with queued jobs, dropping them");
        }

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task failed to join");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: SharedReceiver,
    shutdown: CancellationToken,
    processor: Arc<dyn BlockProcessor>,
    stats: Arc<SyncStats>,
    job_timeout: Duration,
) {
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = next else {
            break;
        };
        run_job(worker_id, job, processor.as_ref(), &stats, job_timeout).await;
    }
    tracing::debug!(worker = worker_id, "worker exiting");
}

async fn run_job(
    worker_id: usize,
    job: Job,
    processor: &dyn BlockProcessor,
    stats: &SyncStats,
    job_timeout: Duration,
) {
    stats.record_started();
    let started = Instant::now();

    let guarded = AssertUnwindSafe(processor.process(job.block_number)).catch_unwind();
    let result = match tokio::time::timeout(job_timeout, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(SyncError::Other(format!(
            "block processing panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => Err(SyncError::JobTimeout {
            block_number: job.block_number,
            timeout_ms: job_timeout.as_millis() as u64,
        }),
    };

    match &result {
        Ok(()) => tracing::debug!(
            worker = worker_id,
            block = job.block_number,
            source = %job.source,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "block processed"
        ),
        Err(e) => tracing::error!(
            worker = worker_id,
            block = job.block_number,
            source = %job.source,
            error = %e,
            "block processing failed"
        ),
    }
    stats.record_finished(result.is_ok());
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
