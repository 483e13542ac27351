//! Health endpoint, wired to the shutdown supervisor.

use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub shutting_down: bool,
    pub in_flight: usize,
}

/// Health check handler
/// GET /health — 200 while serving, 503 once shutdown has begun.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.supervisor.snapshot();
    let body = Json(HealthResponse {
        status: if snapshot.shutting_down {
            "draining".to_string()
        } else {
            "healthy".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        shutting_down: snapshot.shutting_down,
        in_flight: snapshot.in_flight,
    });

    if snapshot.shutting_down {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    } else {
        (StatusCode::OK, body).into_response()
    }
}
