//! SQLite commit log.
//!
//! One row per committed block number in `chainsync_committed_blocks`. The
//! watermark is the lowest committed number without a committed successor,
//! searched from the previous watermark onwards.
//!
//! ```rust,no_run
//! use chainsync_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::open("./chainsync.db").await?;
//! let scratch = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::debug;

use chainsync_core::{Store, SyncError};

use crate::sql::{
    from_sql, limit_to_sql, missing_from_runs, to_sql, WatermarkCursor, COUNT_SQL, LOWEST_SQL,
};

const WATERMARK_FROM_SQL: &str = "SELECT MIN(c.block_number) FROM chainsync_committed_blocks c
     WHERE c.block_number >= ?
       AND NOT EXISTS (
           SELECT 1 FROM chainsync_committed_blocks n WHERE n.block_number = c.block_number + 1
       )";

const FIRST_IN_RANGE_SQL: &str = "SELECT MIN(block_number) FROM chainsync_committed_blocks
     WHERE block_number BETWEEN ? AND ?";

const RUN_ENDS_SQL: &str = "SELECT block_number, next_block FROM (
         SELECT block_number,
                LEAD(block_number) OVER (ORDER BY block_number) AS next_block
         FROM chainsync_committed_blocks
         WHERE block_number BETWEEN ? AND ?
     ) AS runs
     WHERE next_block IS NULL OR next_block <> block_number + 1
     ORDER BY block_number
     LIMIT ?";

/// SQLite-backed [`Store`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    cursor: Arc<WatermarkCursor>,
}

impl SqliteStore {
    /// Open (or create) a database. Accepts a plain path (`./chainsync.db`)
    /// or a SQLite URL (`sqlite:./chainsync.db?mode=rwc`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        // Every connection to `:memory:` is a separate database, so keep
        // exactly one alive for the lifetime of the pool.
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options
            .connect(&url)
            .await
            .map_err(|e| SyncError::Store(format!("sqlite open {url}: {e}")))?;

        let store = Self {
            pool,
            cursor: Arc::default(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Ephemeral database, dropped with the store.
    pub async fn in_memory() -> Result<Self, SyncError> {
        Self::open("sqlite::memory:").await
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chainsync_committed_blocks (
                block_number INTEGER PRIMARY KEY
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Store(e.to_string()))?;

        debug!("sqlite schema initialized");
        Ok(())
    }

    /// Number of committed rows, including those above the watermark.
    pub async fn committed_count(&self) -> Result<u64, SyncError> {
        let count: i64 = sqlx::query_scalar(COUNT_SQL)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        from_sql(count)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn commit_block(&self, block_number: u64) -> Result<(), SyncError> {
        sqlx::query("INSERT OR IGNORE INTO chainsync_committed_blocks (block_number) VALUES (?)")
            .bind(to_sql(block_number)?)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Store(format!("commit block {block_number}: {e}")))?;
        Ok(())
    }

    async fn highest_committed_block(&self) -> Result<Option<u64>, SyncError> {
        let lowest: Option<i64> = sqlx::query_scalar(LOWEST_SQL)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        let Some(lowest) = lowest.map(from_sql).transpose()? else {
            return Ok(None);
        };

        let from = self.cursor.scan_from(lowest);
        let watermark: Option<i64> = sqlx::query_scalar(WATERMARK_FROM_SQL)
            .bind(to_sql(from)?)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        let watermark = match watermark {
            Some(w) => from_sql(w)?,
            None => return Err(SyncError::Store(format!("no committed row at or above {from}"))),
        };
        self.cursor.record(lowest, watermark);
        Ok(Some(watermark))
    }

    async fn missing_blocks(
        &self,
        range: RangeInclusive<u64>,
        limit: usize,
    ) -> Result<Vec<u64>, SyncError> {
        if limit == 0 || range.is_empty() {
            return Ok(Vec::new());
        }
        let (start, end) = (to_sql(*range.start())?, to_sql(*range.end())?);

        let first: Option<i64> = sqlx::query_scalar(FIRST_IN_RANGE_SQL)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        let rows: Vec<(i64, Option<i64>)> = sqlx::query_as(RUN_ENDS_SQL)
            .bind(start)
            .bind(end)
            .bind(limit_to_sql(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;

        let run_ends = rows
            .into_iter()
            .map(|(run_end, next)| -> Result<_, SyncError> {
                Ok((from_sql(run_end)?, next.map(from_sql).transpose()?))
            })
            .collect::<Result<Vec<_>, SyncError>>()?;
        Ok(missing_from_runs(
            range,
            first.map(from_sql).transpose()?,
            &run_ends,
            limit,
        ))
    }
}
