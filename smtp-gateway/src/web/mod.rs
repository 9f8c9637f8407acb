//! Monitoring web server module.
//!
//! Exposes a liveness probe and the backend's delivery counters:
//! - `GET /health`
//! - `GET /stats`

pub mod handlers;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use handlers::{health, stats, AppState, HealthResponse};

/// Build the monitoring router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
