//! Single-block pipeline: fetch → filter chain → commit.
//!
//! Processing is not transactional. If the commit fails after filters have
//! produced side effects, the block is simply processed again later (by the
//! janitor or a duplicate live notification), re-running every filter. Sinks
//! therefore have to deduplicate.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::SyncError;
use crate::fetcher::BlockFetcher;
use crate::filter::FilterChain;
use crate::store::Store;

/// Anything the worker pool can run for a block number.
#[async_trait]
pub trait BlockProcessor: Send + Sync {
    async fn process(&self, block_number: u64) -> Result<(), SyncError>;
}

/// Fetches a block, runs every transaction through the filter chain, and
/// commits the block number.
pub struct Pipeline {
    fetcher: Arc<dyn BlockFetcher>,
    filters: FilterChain,
    store: Arc<dyn Store>,
}

impl Pipeline {
    pub fn new(fetcher: Arc<dyn BlockFetcher>, filters: FilterChain, store: Arc<dyn Store>) -> Self {
        Self {
            fetcher,
            filters,
            store,
        }
    }

    /// Process `block_number` end to end.
    ///
    /// The first error at any stage aborts the run and is returned unchanged;
    /// nothing is retried here.
    pub async fn run(&self, block_number: u64) -> Result<(), SyncError> {
        let block = self.fetcher.fetch_block(block_number).await?;

        for tx in &block.transactions {
            self.filters.apply(&block.header, tx).await?;
        }

        self.store.commit_block(block_number).await?;

        tracing::debug!(
            block = block_number,
            txs = block.transactions.len(),
            "block committed"
        );
        Ok(())
    }
}

#[async_trait]
impl BlockProcessor for Pipeline {
    async fn process(&self, block_number: u64) -> Result<(), SyncError> {
        self.run(block_number).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}
