//! Status endpoint.

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use chainsync_core::{StatsSnapshot, SyncStats};

pub fn router(stats: Arc<SyncStats>) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/health", get(|| async { "ok" }))
        .with_state(stats)
}

/// HTTP handler for `GET /stats`.
async fn get_stats(State(stats): State<Arc<SyncStats>>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}

/// Serve until `shutdown` is cancelled, then finish in-flight requests.
pub async fn serve(
    listener: TcpListener,
    stats: Arc<SyncStats>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status endpoint listening");
    }
    axum::serve(listener, router(stats))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
