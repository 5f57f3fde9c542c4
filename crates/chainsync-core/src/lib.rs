//! chainsync-core: the block synchronization engine.
//!
//! # Architecture
//!
//! ```text
//! SyncEngine
//!   ├── HeadSyncer   (live newHeads subscription, resubscribe with backoff)
//!   ├── Janitor      (periodic gap sweep against the committed watermark)
//!   └── WorkerPool   (bounded queue + fixed workers, per-job deadline)
//!          └── Pipeline  (fetch → filter chain → commit)
//!                 ├── BlockFetcher
//!                 ├── FilterChain
//!                 └── Store
//! ```
//!
//! Both producers may submit the same block number; everything downstream of
//! the pool is required to be idempotent.

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod pipeline;
pub mod pool;
pub mod stats;
pub mod store;
pub mod syncer;
pub mod types;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use config::{HeadSyncerConfig, JanitorConfig, PoolConfig, SyncConfig};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use fetcher::BlockFetcher;
pub use filter::{Filter, FilterChain, Verdict};
pub use pipeline::{BlockProcessor, Pipeline};
pub use pool::{Job, JobSource, WorkerPool};
pub use stats::{StatsSnapshot, SyncStats};
pub use store::Store;
pub use syncer::head::{HeadSyncer, HeaderSource, HeaderStream};
pub use syncer::janitor::{Janitor, SweepReport};
pub use types::{BlockHeader, FetchedBlock, Log, Transaction};
