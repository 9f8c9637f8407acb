//! Monitoring endpoint handlers.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::session::{Backend, Counts};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub backend: Backend,
}

impl AppState {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Delivery Stats
// =============================================================================

/// Delivery counters since startup.
pub async fn stats(State(state): State<AppState>) -> Json<Counts> {
    Json(state.backend.counters().await)
}
