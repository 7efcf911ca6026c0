// src/routes/health.rs
//! Liveness endpoint.
//!
//! Used by process supervisors and the end-to-end tests to learn that the
//! service is accepting requests. It reads the registry but never opens a
//! site database.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AuditService;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sites: usize,
}

/// Handle `GET /health`.
async fn health(State(service): State<AuditService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sites: service.sites().await.len(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AuditService> {
    Router::new().route("/health", get(health))
}
