//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur while syncing blocks.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Fetch error for block {block_number}: {reason}")]
    Fetch { block_number: u64, reason: String },

    #[error("Filter error in '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Subscription gave up after {attempts} attempts: {last_error}")]
    SubscriptionExhausted { attempts: u32, last_error: String },

    #[error("Job for block {block_number} exceeded its {timeout_ms}ms deadline")]
    JobTimeout { block_number: u64, timeout_ms: u64 },

    #[error("Worker pool queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Worker pool is stopped")]
    PoolStopped,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Shorthand for a filter failure.
    pub fn filter(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Filter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a fetch failure.
    pub fn fetch(block_number: u64, reason: impl Into<String>) -> Self {
        Self::Fetch {
            block_number,
            reason: reason.into(),
        }
    }

    /// Returns `true` if a later attempt at the same work may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. }
                | Self::Store(_)
                | Self::Subscription(_)
                | Self::JobTimeout { .. }
                | Self::QueueFull { .. }
        )
    }
}
