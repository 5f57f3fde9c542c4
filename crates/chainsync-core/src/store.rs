//! The `Store` trait, the durable record of processed blocks.
//!
//! Commits complete out of order, so the store reports a *watermark* rather
//! than the maximum committed number: the end of the lowest contiguous run of
//! committed blocks. A block that failed while later blocks succeeded stays
//! above the watermark and is picked up again by the janitor.

use async_trait::async_trait;
use std::ops::RangeInclusive;

use crate::error::SyncError;

/// Durable commit log for processed block numbers.
///
/// Implementations include `InMemoryStore`, `SqliteStore` and
/// `PostgresStore` in `chainsync-storage`. They must accept concurrent
/// `commit_block` calls.
#[async_trait]
pub trait Store: Send + Sync {
    /// Record that `block_number` has been processed.
    ///
    /// Idempotent: committing the same number again is a no-op.
    async fn commit_block(&self, block_number: u64) -> Result<(), SyncError>;

    /// Highest block `N` such that every block from the lowest committed
    /// block through `N` is committed. `None` when nothing is committed yet.
    async fn highest_committed_block(&self) -> Result<Option<u64>, SyncError>;

    /// Uncommitted block numbers inside `range`, ascending, at most `limit`
    /// of them. Blocks committed above a failing one are not returned, so a
    /// sweep never re-runs them.
    async fn missing_blocks(
        &self,
        range: RangeInclusive<u64>,
        limit: usize,
    ) -> Result<Vec<u64>, SyncError>;
}

/// Seed an empty store with `lower_bound` so gap filling starts at
/// `lower_bound + 1` instead of genesis.
///
/// Returns the watermark after bootstrapping.
pub async fn bootstrap(store: &dyn Store, lower_bound: u64) -> Result<u64, SyncError> {
    if let Some(watermark) = store.highest_committed_block().await? {
        tracing::info!(watermark, "store already bootstrapped");
        return Ok(watermark);
    }
    store.commit_block(lower_bound).await?;
    tracing::info!(lower_bound, "store bootstrapped with initial lower bound");
    Ok(store.highest_committed_block().await?.unwrap_or(lower_bound))
}

/// Compute the contiguous watermark over an ascending iterator of committed
/// block numbers.
pub fn contiguous_watermark(mut committed: impl Iterator<Item = u64>) -> Option<u64> {
    let mut watermark = committed.next()?;
    for number in committed {
        if number != watermark + 1 {
            break;
        }
        watermark = number;
    }
    Some(watermark)
}

/// The first `limit` numbers of `range` for which `is_committed` is false.
///
/// Linear in the span walked; backends with an ordered index should answer
/// [`Store::missing_blocks`] from their runs instead.
pub fn missing_in(
    range: RangeInclusive<u64>,
    limit: usize,
    is_committed: impl Fn(u64) -> bool,
) -> Vec<u64> {
    range.filter(|&n| !is_committed(n)).take(limit).collect()
}
