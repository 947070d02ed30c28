//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use concept_sync_runtime::{HealthCheck, HealthReport, HealthStatus};
use serde_json::{Value, json};

/// Root endpoint.
///
/// ```text
/// GET /
/// {"status": "ok", "message": "Requesting server running", "port": 10000}
/// ```
#[allow(clippy::unused_async)]
pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Requesting server running",
        "port": state.config.port,
    }))
}

/// Liveness check. Does not look at the engine.
///
/// ```text
/// GET /health
/// {"status": "ok", "port": 10000}
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "port": state.config.port }))
}

/// Readiness check over the engine and the bridge.
///
/// # Status Codes
///
/// - 200 OK: Healthy or Degraded
/// - 503 Service Unavailable: Unhealthy (the engine is shutting down)
#[allow(clippy::unused_async)]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let requesting = HealthCheck::healthy("requesting")
        .with_metadata("pending", state.requesting.pending_count().to_string())
        .with_metadata("timeout_ms", state.config.requesting.timeout.as_millis().to_string());
    let report = HealthReport::new(vec![state.engine.health(), requesting]);

    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}
