//! Liveness and readiness probes.
//!
//! `/healthz` answers as soon as the process serves HTTP. `/readyz` reports
//! ready only after the report cache finished its initial sync.

use crate::error::ControllerError;
use crate::report_cache::ReportCache;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(cache): State<Arc<ReportCache>>) -> (StatusCode, &'static str) {
    if cache.is_synced() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "report cache not synced")
    }
}

/// Probe routes backed by the report cache
pub fn router(cache: Arc<ReportCache>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(cache)
}

/// Serve the probes on `addr` until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, cache: Arc<ReportCache>, shutdown: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health probes listening on {}", addr);
    axum::serve(listener, router(cache))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
