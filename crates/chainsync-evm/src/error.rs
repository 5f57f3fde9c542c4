//! Transport-level errors for the EVM collaborators.

use thiserror::Error;

use crate::rpc::NodeError;

/// Errors raised while talking to a node.
///
/// These stay inside this crate; the trait implementations convert them into
/// [`SyncError`](chainsync_core::SyncError) with the failing block or method
/// as context.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, non-2xx status, ...).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connect/send/receive failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC error object returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(NodeError),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response did not have the expected shape.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns `true` for failures worth retrying on the same endpoint.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. } => true,
            // -32005 is the de-facto "limit exceeded" code across providers.
            Self::Rpc(e) => e.code == -32005,
            Self::Decode(_) | Self::Deserialization(_) => false,
        }
    }

    /// Returns `true` if the node does not implement the method.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Rpc(e) if e.code == -32601)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout { ms: 0 }
        } else {
            Self::Http(e.to_string())
        }
    }
}
