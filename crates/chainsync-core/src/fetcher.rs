//! The `BlockFetcher` trait: how the pipeline obtains a full block.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::FetchedBlock;

/// Fetches a block header and its full transaction list by number.
///
/// Implementations must be `Send + Sync`: a single fetcher is shared by every
/// pool worker. Failures should be reported as [`SyncError::Fetch`].
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn fetch_block(&self, block_number: u64) -> Result<FetchedBlock, SyncError>;
}
