//! Live head syncer.
//!
//! Subscribes to new block headers and submits one pool job per header. A
//! failed subscribe is retried with capped exponential backoff; a stream that
//! errors or ends sends the loop back to subscribing.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backoff::{sleep_or_cancel, BackoffPolicy};
use crate::config::HeadSyncerConfig;
use crate::error::SyncError;
use crate::pool::{Job, WorkerPool};
use crate::stats::SyncStats;
use crate::types::BlockHeader;

/// Stream of new block headers. Dropping it ends the subscription.
pub type HeaderStream = Pin<Box<dyn Stream<Item = Result<BlockHeader, SyncError>> + Send>>;

/// Opens header subscriptions (for example `eth_subscribe("newHeads")`).
#[async_trait]
pub trait HeaderSource: Send + Sync {
    async fn subscribe(&self) -> Result<HeaderStream, SyncError>;
}

enum Listen {
    Shutdown,
    Dropped(String),
}

/// Turns a header subscription into head jobs on the worker pool.
pub struct HeadSyncer {
    source: Arc<dyn HeaderSource>,
    pool: Arc<WorkerPool>,
    stats: Arc<SyncStats>,
    backoff: BackoffPolicy,
}

impl HeadSyncer {
    pub fn new(
        source: Arc<dyn HeaderSource>,
        pool: Arc<WorkerPool>,
        stats: Arc<SyncStats>,
        config: &HeadSyncerConfig,
    ) -> Self {
        Self {
            source,
            pool,
            stats,
            backoff: BackoffPolicy::new(config.backoff()),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Returns `Err(SubscriptionExhausted)` only when a maximum number of
    /// attempts is configured and that many subscribes fail in a row.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), SyncError> {
        let mut failures = 0u32;

        loop {
            let subscribed = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.source.subscribe() => result,
            };

            let delay = match subscribed {
                Ok(stream) => {
                    failures = 0;
                    tracing::info!("head subscription established");
                    match self.listen(stream, &shutdown).await? {
                        Listen::Shutdown => break,
                        Listen::Dropped(reason) => {
                            tracing::warn!(reason = %reason, "head subscription dropped, resubscribing");
                            self.backoff.delay_for(1)
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    match self.backoff.next_delay(failures) {
                        Some(delay) => {
                            tracing::warn!(
                                attempt = failures,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %e,
                                "head subscription failed"
                            );
                            delay
                        }
                        None => {
                            tracing::error!(
                                attempts = failures,
                                error = %e,
                                "giving up on head subscription"
                            );
                            return Err(SyncError::SubscriptionExhausted {
                                attempts: failures,
                                last_error: e.to_string(),
                            });
                        }
                    }
                }
            };

            if !sleep_or_cancel(delay, &shutdown).await {
                break;
            }
        }

        tracing::info!("head syncer stopped");
        Ok(())
    }

    async fn listen(
        &self,
        mut stream: HeaderStream,
        shutdown: &CancellationToken,
    ) -> Result<Listen, SyncError> {
        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => return Ok(Listen::Shutdown),
                item = stream.next() => item,
            };

            let header = match item {
                Some(Ok(header)) => header,
                Some(Err(e)) => return Ok(Listen::Dropped(e.to_string())),
                None => return Ok(Listen::Dropped("header stream ended".into())),
            };

            self.stats.update_head_cursor(header.number);
            tracing::debug!(block = header.number, hash = %header.hash, "new head");

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(Listen::Shutdown),
                submitted = self.pool.submit(Job::head(header.number)) => submitted?,
            }
        }
    }
}

impl std::fmt::Debug for HeadSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadSyncer")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BlockProcessor;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};

    enum Script {
        Fail(&'static str),
        Headers(Vec<u64>),
        HeadersThenError(Vec<u64>),
    }

    /// Plays back one scripted outcome per subscribe; once the script runs out
    /// every subscribe yields a stream that never produces anything.
    struct ScriptedSource {
        script: Mutex<VecDeque<Script>>,
        subscribes: AtomicU32,
        dropped: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                subscribes: AtomicU32::new(0),
                dropped: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    struct DropFlag<S> {
        inner: S,
        flag: Arc<AtomicBool>,
    }

    impl<S: Stream + Unpin> Stream for DropFlag<S> {
        type Item = S::Item;
        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
            self.inner.poll_next_unpin(cx)
        }
    }

    impl<S> Drop for DropFlag<S> {
        fn drop(&mut self) {
            self.flag.store(true, Ordering::SeqCst);
        }
    }

    fn header(number: u64) -> Result<BlockHeader, SyncError> {
        Ok(BlockHeader {
            number,
            hash: format!("0x{number:x}"),
            parent_hash: "0x0".into(),
            timestamp: 0,
        })
    }

    #[async_trait]
    impl HeaderSource for ScriptedSource {
        async fn subscribe(&self) -> Result<HeaderStream, SyncError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Script::Fail(reason)) => Err(SyncError::Subscription(reason.into())),
                Some(Script::Headers(numbers)) => {
                    let items: Vec<_> = numbers.into_iter().map(header).collect();
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Some(Script::HeadersThenError(numbers)) => {
                    let mut items: Vec<_> = numbers.into_iter().map(header).collect();
                    items.push(Err(SyncError::Subscription("socket closed".into())));
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                None => Ok(Box::pin(DropFlag {
                    inner: futures::stream::pending::<Result<BlockHeader, SyncError>>(),
                    flag: self.dropped.clone(),
                })),
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u64>>);

    #[async_trait]
    impl BlockProcessor for Recorder {
        async fn process(&self, block_number: u64) -> Result<(), SyncError> {
            self.0.lock().unwrap().push(block_number);
            Ok(())
        }
    }

    fn fast_config(max_attempts: Option<u32>) -> HeadSyncerConfig {
        HeadSyncerConfig {
            resubscribe_backoff_ms: 10,
            resubscribe_backoff_max_ms: 40,
            max_resubscribe_attempts: max_attempts,
        }
    }

    struct Harness {
        syncer: Arc<HeadSyncer>,
        pool: Arc<WorkerPool>,
        stats: Arc<SyncStats>,
        recorder: Arc<Recorder>,
    }

    fn harness(source: Arc<ScriptedSource>, config: HeadSyncerConfig) -> Harness {
        let stats = Arc::new(SyncStats::new());
        let recorder = Arc::new(Recorder::default());
        let pool = Arc::new(WorkerPool::with_timeout(
            2,
            16,
            Duration::from_secs(5),
            recorder.clone(),
            stats.clone(),
        ));
        let syncer = Arc::new(HeadSyncer::new(source, pool.clone(), stats.clone(), &config));
        Harness {
            syncer,
            pool,
            stats,
            recorder,
        }
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn headers_become_jobs_and_move_the_cursor() {
        let source = ScriptedSource::new(vec![Script::HeadersThenError(vec![10, 11, 9])]);
        let h = harness(source.clone(), fast_config(None));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let syncer = h.syncer.clone();
            let shutdown = shutdown.clone();
            async move { syncer.start(shutdown).await }
        });

        wait_until("three jobs", || h.stats.completed() == 3).await;
        // Cursor is the latest header seen, not the highest.
        assert_eq!(h.stats.head_cursor(), 9);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        h.pool.stop().await;

        let mut seen = h.recorder.0.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![9, 10, 11]);
    }

    #[tokio::test]
    async fn resubscribes_after_failures_and_keeps_delivering() {
        let source = ScriptedSource::new(vec![
            Script::Fail("connection refused"),
            Script::Fail("connection refused"),
            Script::Headers(vec![20]),
            Script::Headers(vec![21]),
        ]);
        let h = harness(source.clone(), fast_config(Some(5)));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let syncer = h.syncer.clone();
            let shutdown = shutdown.clone();
            async move { syncer.start(shutdown).await }
        });

        wait_until("both headers", || h.stats.completed() == 2).await;
        wait_until("idle subscription", || {
            source.subscribes.load(Ordering::SeqCst) >= 5
        })
        .await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        h.pool.stop().await;
        assert!(source.dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn gives_up_after_max_consecutive_failures() {
        let source = ScriptedSource::new(vec![
            Script::Fail("refused first"),
            Script::Fail("refused second"),
            Script::Fail("refused third"),
            Script::Fail("refused fourth"),
        ]);
        let h = harness(source.clone(), fast_config(Some(3)));

        let err = h.syncer.start(CancellationToken::new()).await.unwrap_err();

        match err {
            SyncError::SubscriptionExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("third"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 3);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn dropped_stream_does_not_count_toward_the_limit() {
        let source = ScriptedSource::new(vec![
            Script::Fail("a"),
            Script::Headers(vec![1]),
            Script::Fail("b"),
            Script::Headers(vec![2]),
        ]);
        let h = harness(source.clone(), fast_config(Some(2)));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let syncer = h.syncer.clone();
            let shutdown = shutdown.clone();
            async move { syncer.start(shutdown).await }
        });

        wait_until("both headers", || h.stats.completed() == 2).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let source = ScriptedSource::new(vec![Script::Fail("down")]);
        let config = HeadSyncerConfig {
            resubscribe_backoff_ms: 60_000,
            resubscribe_backoff_max_ms: 60_000,
            max_resubscribe_attempts: None,
        };
        let h = harness(source.clone(), config);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let syncer = h.syncer.clone();
            let shutdown = shutdown.clone();
            async move { syncer.start(shutdown).await }
        });

        wait_until("first attempt", || source.subscribes.load(Ordering::SeqCst) == 1).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("syncer should stop promptly")
            .unwrap()
            .unwrap();
        h.pool.stop().await;
    }
}
