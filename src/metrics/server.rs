//! Prometheus exporter and health endpoint.

use axum::{Extension, Json, Router, http::StatusCode, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{Value, json};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};
use crate::pipeline::PipelineState;

/// Install the Prometheus recorder and serve it over HTTP.
///
/// The server exposes:
/// - `/metrics` - Prometheus metrics in text format
/// - `/health` - run state as JSON; 503 once the run has stopped
pub fn init(addr: SocketAddr, state: watch::Receiver<PipelineState>) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(run_server(addr, handle, state));

    Ok(())
}

fn router(handle: PrometheusHandle, state: watch::Receiver<PipelineState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
        .layer(Extension(state))
}

async fn run_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
    state: watch::Receiver<PipelineState>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };
    info!("Metrics server listening on {}", addr);

    if let Err(e) = axum::serve(listener, router(handle, state)).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler(
    Extension(state): Extension<watch::Receiver<PipelineState>>,
) -> (StatusCode, Json<Value>) {
    let current = *state.borrow();
    let (status, label) = if current == PipelineState::Stopped {
        (StatusCode::SERVICE_UNAVAILABLE, "stopped")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        status,
        Json(json!({ "status": label, "state": current.as_str() })),
    )
}
