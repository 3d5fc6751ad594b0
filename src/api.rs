use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use axum::{Router, extract::State, response::Json, routing::get};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{models::health::HealthReport, supervisor::Supervisor};

/// Serves the supervisor's health report. Degraded still answers 200; the
/// body carries the per-worker detail.
pub async fn run_health_server(supervisor: Arc<Supervisor>, port: u16) -> Result<(), Error> {
    let app = Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow!("Failed to bind health endpoint on {addr}: {e}"))?;

    info!(address = %addr, "Health endpoint started");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("Health endpoint failed: {e}"))
}

async fn health_check(State(supervisor): State<Arc<Supervisor>>) -> Json<HealthReport> {
    Json(supervisor.health_check().await)
}
