//! Metrics HTTP server
//!
//! Serves the current [`MetricsSnapshot`] as JSON on `GET /metrics`.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::metrics::{collect_system_metrics, MetricsSnapshot, SharedMetrics};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let mut snapshot = metrics.read().await.clone();
    snapshot.system = tokio::task::spawn_blocking(collect_system_metrics)
        .await
        .unwrap_or_default();
    snapshot.touch();
    Json(snapshot)
}

/// Creates the axum Router with the metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Serve metrics on `addr` until the task is dropped
pub async fn run_metrics_server(metrics: SharedMetrics, addr: SocketAddr) -> Result<(), ServerError> {
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
