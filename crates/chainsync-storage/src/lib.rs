//! chainsync-storage: `Store` backends for the chainsync commit log.
//!
//! Backends:
//! - [`memory`]: in-memory interval set (dev/testing, no persistence)
//! - `sqlite`: SQLite via `sqlx` (feature `sqlite`)
//! - `postgres`: PostgreSQL via `sqlx` (feature `postgres`)
//!
//! Every backend reports the contiguous watermark from
//! [`Store::highest_committed_block`](chainsync_core::Store::highest_committed_block).

use std::sync::Arc;

use chainsync_core::{Store, SyncError};

pub mod memory;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod sql;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStore};

/// Open the backend named by `url`'s scheme: `memory://`, `sqlite:...` or
/// `postgres://...`.
pub async fn connect(url: &str) -> Result<Arc<dyn Store>, SyncError> {
    let scheme = url.split(':').next().unwrap_or_default();
    match scheme {
        "memory" => {
            tracing::warn!("using in-memory store, progress is lost on restart");
            Ok(Arc::new(InMemoryStore::new()))
        }
        #[cfg(feature = "sqlite")]
        "sqlite" => Ok(Arc::new(SqliteStore::open(url).await?)),
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => Ok(Arc::new(PostgresStore::connect(url).await?)),
        #[cfg(not(feature = "sqlite"))]
        "sqlite" => Err(not_enabled(scheme)),
        #[cfg(not(feature = "postgres"))]
        "postgres" | "postgresql" => Err(not_enabled(scheme)),
        other => Err(SyncError::Config(format!("unknown store scheme `{other}`"))),
    }
}

#[allow(dead_code)]
fn not_enabled(scheme: &str) -> SyncError {
    SyncError::Config(format!("store scheme `{scheme}` is not enabled in this build"))
}
