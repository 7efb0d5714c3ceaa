//! Service-mode HTTP surface
//!
//! `/healthz` serves the runner's health snapshot (503 only once a
//! component is unhealthy), `/readyz` whether the runner is serving, and
//! `/metrics` the Prometheus text exposition.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use harness_lib::{health::Status, HarnessMetrics, HealthRegistry};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiState {
    pub health: HealthRegistry,
    /// Held so the harness collectors are registered before the first scrape
    pub metrics: HarnessMetrics,
}

impl ApiState {
    pub fn new(health: HealthRegistry) -> Self {
        Self {
            health,
            metrics: HarnessMetrics::new(),
        }
    }
}

fn liveness_code(status: Status) -> StatusCode {
    match status {
        Status::Healthy | Status::Degraded => StatusCode::OK,
        Status::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn healthz(State(state): State<ApiState>) -> Response {
    let snapshot = state.health.snapshot().await;
    (liveness_code(snapshot.status), Json(snapshot)).into_response()
}

async fn readyz(State(state): State<ApiState>) -> Response {
    let readiness = state.health.readiness().await;
    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness)).into_response()
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut body) {
        Ok(()) => (
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(
    port: u16,
    state: ApiState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "Serving health and metrics");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unhealthy_fails_liveness() {
        assert_eq!(liveness_code(Status::Healthy), StatusCode::OK);
        assert_eq!(liveness_code(Status::Degraded), StatusCode::OK);
        assert_eq!(
            liveness_code(Status::Unhealthy),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
