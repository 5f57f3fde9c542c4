//! PostgreSQL commit log.
//!
//! Requires the `postgres` feature:
//! ```toml
//! chainsync-storage = { version = "0.2", features = ["postgres"] }
//! ```
//!
//! The `chainsync_committed_blocks` table is created on first connect.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use chainsync_core::{Store, SyncError};

use crate::sql::{
    from_sql, limit_to_sql, missing_from_runs, to_sql, WatermarkCursor, COUNT_SQL, LOWEST_SQL,
};

const TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS chainsync_committed_blocks (
    block_number BIGINT PRIMARY KEY,
    committed_at BIGINT NOT NULL DEFAULT EXTRACT(EPOCH FROM NOW())::BIGINT
)";

const WATERMARK_FROM_SQL: &str = "SELECT MIN(c.block_number) FROM chainsync_committed_blocks c
     WHERE c.block_number >= $1
       AND NOT EXISTS (
           SELECT 1 FROM chainsync_committed_blocks n WHERE n.block_number = c.block_number + 1
       )";

const FIRST_IN_RANGE_SQL: &str = "SELECT MIN(block_number) FROM chainsync_committed_blocks
     WHERE block_number BETWEEN $1 AND $2";

const RUN_ENDS_SQL: &str = "SELECT block_number, next_block FROM (
         SELECT block_number,
                LEAD(block_number) OVER (ORDER BY block_number) AS next_block
         FROM chainsync_committed_blocks
         WHERE block_number BETWEEN $1 AND $2
     ) AS runs
     WHERE next_block IS NULL OR next_block <> block_number + 1
     ORDER BY block_number
     LIMIT $3";

// ─── Connection options ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum pooled connections (default: 10). Should be at least the
    /// worker pool size or commits queue on the pool.
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

// ─── PostgresStore ────────────────────────────────────────────────────────────

/// PostgreSQL-backed [`Store`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    cursor: Arc<WatermarkCursor>,
}

impl PostgresStore {
    /// Connect with default pool options and create the schema.
    ///
    /// `url` follows libpq: `postgresql://[user[:password]@][host][:port][/dbname]`.
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        Self::connect_with_options(url, PostgresOptions::default()).await
    }

    pub async fn connect_with_options(
        url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(opts.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| SyncError::Store(format!("postgres connect: {e}")))?;

        sqlx::query(TABLE_SQL)
            .execute(&pool)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;

        info!(max_connections = opts.max_connections, "postgres store ready");
        Ok(Self {
            pool,
            cursor: Arc::default(),
        })
    }

    pub async fn committed_count(&self) -> Result<u64, SyncError> {
        let count: i64 = sqlx::query_scalar(COUNT_SQL)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        from_sql(count)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn commit_block(&self, block_number: u64) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO chainsync_committed_blocks (block_number) VALUES ($1)
             ON CONFLICT (block_number) DO NOTHING",
        )
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
        let Some(watermark) = watermark.map(from_sql).transpose()? else {
            return Err(SyncError::Store(format!("no committed row at or above {from}")));
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
            .map_err(|e| SyncError::Store(format!("missing blocks {start}..={end}: {e}")))?;

        let mut run_ends = Vec::with_capacity(rows.len());
        for (run_end, next) in rows {
            run_ends.push((from_sql(run_end)?, next.map(from_sql).transpose()?));
        }
        Ok(missing_from_runs(
            range,
            first.map(from_sql).transpose()?,
            &run_ends,
            limit,
        ))
    }
}
