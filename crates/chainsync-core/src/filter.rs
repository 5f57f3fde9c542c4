//! Filter trait and the ordered filter chain.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::SyncError;
use crate::types::{BlockHeader, Transaction};

/// What the chain should do after a filter has seen a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the transaction to the next filter.
    Continue,
    /// Skip the remaining filters for this transaction only.
    Stop,
}

/// A single stage of the filter chain.
///
/// Filters are shared across concurrently running pipeline jobs, so any
/// internal state must be synchronized. A filter that produces a durable side
/// effect must be dedup-safe: the same block can be processed more than once.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Inspect one transaction of `header`'s block.
    async fn execute(&self, header: &BlockHeader, tx: &Transaction) -> Result<Verdict, SyncError>;

    /// Name used in logs and error messages.
    fn name(&self) -> &str;
}

/// Ordered sequence of filters applied to every transaction of a block.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter to the end of the chain.
    pub fn with(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append a filter to the end of the chain.
    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filter names, in chain order.
    pub fn names(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name().to_string()).collect()
    }

    /// Run one transaction through the chain.
    ///
    /// Stops at the first [`Verdict::Stop`]; the first error is returned as is.
    pub async fn apply(&self, header: &BlockHeader, tx: &Transaction) -> Result<(), SyncError> {
        for filter in &self.filters {
            match filter.execute(header, tx).await? {
                Verdict::Continue => {}
                Verdict::Stop => {
                    tracing::trace!(
                        filter = filter.name(),
                        tx = %tx.hash,
                        "filter chain short-circuited"
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixed {
        name: String,
        verdict: Verdict,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Filter for Fixed {
        async fn execute(&self, _h: &BlockHeader, _t: &Transaction) -> Result<Verdict, SyncError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.verdict)
        }
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn fixed(name: &str, verdict: Verdict) -> (Arc<dyn Filter>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let filter = Arc::new(Fixed {
            name: name.into(),
            verdict,
            calls: calls.clone(),
        });
        (filter, calls)
    }

    fn header() -> BlockHeader {
        BlockHeader {
            number: 1,
            hash: "0xa".into(),
            parent_hash: "0x0".into(),
            timestamp: 0,
        }
    }

    fn tx() -> Transaction {
        Transaction {
            hash: "0x1".into(),
            from: "0xf".into(),
            to: None,
            value: "0x0".into(),
            input: "0x".into(),
            index: 0,
            success: true,
            logs: vec![],
        }
    }

    #[tokio::test]
    async fn stop_skips_later_filters() {
        let (a, a_calls) = fixed("a", Verdict::Stop);
        let (b, b_calls) = fixed("b", Verdict::Continue);
        let chain = FilterChain::new().with(a).with(b);

        chain.apply(&header(), &tx()).await.unwrap();

        assert_eq!(a_calls.load(Ordering::Relaxed), 1);
        assert_eq!(b_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn continue_runs_every_filter() {
        let (a, a_calls) = fixed("a", Verdict::Continue);
        let (b, b_calls) = fixed("b", Verdict::Continue);
        let chain = FilterChain::new().with(a).with(b);

        chain.apply(&header(), &tx()).await.unwrap();

        assert_eq!(a_calls.load(Ordering::Relaxed), 1);
        assert_eq!(b_calls.load(Ordering::Relaxed), 1);
        assert_eq!(chain.names(), vec!["a", "b"]);
    }
}
