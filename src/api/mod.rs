mod error;
pub mod models;
pub mod services;
pub mod state;

use axum::{routing::get, Router};

use state::AppState;

/// Operator-facing read router: health plus job inspection. Job intake
/// itself is queue-driven, not HTTP.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(services::health))
        .route("/operators/health", get(services::health))
        .route("/operators/jobs/{job_id}", get(services::get_job))
        .route("/operators/stats", get(services::stats))
        .with_state(state)
}
