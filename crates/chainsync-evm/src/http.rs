//! HTTP JSON-RPC client backed by `reqwest`, with retry on transient errors.

use async_trait::async_trait;
use std::time::Duration;

use chainsync_core::{BackoffConfig, BackoffPolicy};

use crate::error::TransportError;
use crate::rpc::{RpcRequest, RpcResponse, RpcTransport};

/// Configuration for [`HttpRpcClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    /// Backoff between retries of a transient failure. `max_attempts` bounds
    /// the total number of tries per request.
    pub retry: BackoffConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            retry: BackoffConfig {
                initial: Duration::from_millis(200),
                max: Duration::from_secs(2),
                multiplier: 2.0,
                max_attempts: Some(3),
            },
        }
    }
}

pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    retry: BackoffPolicy,
    request_timeout: Duration,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            retry: BackoffPolicy::new(config.retry),
            request_timeout: config.request_timeout,
        })
    }

    async fn send_once(&self, req: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<RpcResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        match TransportError::from(e) {
            TransportError::Timeout { .. } => TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            },
            other => other,
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: RpcRequest) -> Result<RpcResponse, TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.send_once(&req).await {
                Ok(resp) => match resp.node_error().cloned().map(TransportError::Rpc) {
                    Some(e) if e.is_retryable() => e,
                    _ => return Ok(resp),
                },
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            match self.retry.next_delay(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        method = %req.method,
                        error = %err,
                        url = %self.url,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        attempt,
                        method = %req.method,
                        error = %err,
                        url = %self.url,
                        "max retries exceeded"
                    );
                    return Err(err);
                }
            }
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for HttpRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRpcClient")
            .field("url", &self.url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
