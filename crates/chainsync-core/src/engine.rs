//! Process lifecycle: bootstrap the store, start the pool, run both producers,
//! drain on shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::fetcher::BlockFetcher;
use crate::filter::FilterChain;
use crate::pipeline::Pipeline;
use crate::pool::WorkerPool;
use crate::stats::{spawn_stats_reporter, SyncStats};
use crate::store::{self, Store};
use crate::syncer::head::{HeadSyncer, HeaderSource};
use crate::syncer::janitor::Janitor;

/// Owns the collaborators and runs the head syncer and janitor over one
/// shared worker pool.
///
/// # Example
///
/// ```rust,ignore
/// let engine = SyncEngine::new(config, fetcher, filters, store, headers);
/// let stats = engine.stats();
/// engine.run(shutdown.clone()).await?;
/// ```
pub struct SyncEngine {
    config: SyncConfig,
    fetcher: Arc<dyn BlockFetcher>,
    filters: FilterChain,
    store: Arc<dyn Store>,
    headers: Arc<dyn HeaderSource>,
    stats: Arc<SyncStats>,
    sweep_interval: Option<Duration>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        fetcher: Arc<dyn BlockFetcher>,
        filters: FilterChain,
        store: Arc<dyn Store>,
        headers: Arc<dyn HeaderSource>,
    ) -> Self {
        Self {
            config,
            fetcher,
            filters,
            store,
            headers,
            stats: Arc::new(SyncStats::new()),
            sweep_interval: None,
        }
    }

    /// Use an externally owned stats handle (e.g. one shared with a status
    /// endpoint created before the engine).
    pub fn with_stats(mut self, stats: Arc<SyncStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Override the janitor period configured in whole seconds.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        self.stats.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run until `shutdown` is cancelled or a producer fails for good.
    ///
    /// On the way out both loops are stopped first, then the pool: queued jobs
    /// are dropped and in-flight jobs are allowed to finish or time out.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SyncError> {
        self.config.validate()?;

        let watermark = store::bootstrap(self.store.as_ref(), self.config.initial_lower_bound).await?;

        let pipeline = Arc::new(Pipeline::new(
            self.fetcher.clone(),
            self.filters.clone(),
            self.store.clone(),
        ));
        let pool = Arc::new(WorkerPool::start(
            &self.config.pool,
            pipeline,
            self.stats.clone(),
        ));

        let head = HeadSyncer::new(
            self.headers.clone(),
            pool.clone(),
            self.stats.clone(),
            &self.config.head,
        );
        let mut janitor = Janitor::new(
            pool.clone(),
            self.store.clone(),
            self.stats.clone(),
            &self.config.janitor,
        );
        if let Some(interval) = self.sweep_interval {
            janitor = janitor.with_sweep_interval(interval);
        }

        let loops = shutdown.child_token();
        let reporter = spawn_stats_reporter(
            self.stats.clone(),
            loops.clone(),
            self.config.stats_log_interval(),
        );

        tracing::info!(
            watermark,
            filters = ?self.filters.names(),
            "sync engine started"
        );

        let (head_result, janitor_result) = tokio::join!(
            async {
                let result = head.start(loops.clone()).await;
                if let Err(e) = &result {
                    tracing::error!(error = %e, "head syncer failed, stopping engine");
                    loops.cancel();
                }
                result
            },
            async {
                let result = janitor.start(loops.clone()).await;
                if let Err(e) = &result {
                    tracing::error!(error = %e, "janitor failed, stopping engine");
                    loops.cancel();
                }
                result
            },
        );

        loops.cancel();
        pool.stop().await;
        if let Err(e) = reporter.await {
            tracing::warn!(error = %e, "stats reporter task failed");
        }

        let snapshot = self.stats.snapshot();
        tracing::info!(
            head = snapshot.head_cursor,
            completed = snapshot.pool_completed,
            failed = snapshot.pool_failed,
            "sync engine stopped"
        );

        head_result.and(janitor_result)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}
