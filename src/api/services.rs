use axum::{extract::State, response::IntoResponse, Json};

use super::models::{HealthResponse, JobView};
use super::state::AppState;
use crate::api::error::ApiError;

/// Job inspection endpoint (GET /operators/jobs/{job_id})
pub async fn get_job(
    State(state): State<AppState>,
    axum::extract::Path(job_id): axum::extract::Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .repo
        .find_by_id(&job_id)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to load job: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    Ok((axum::http::StatusCode::OK, Json(JobView::from(job))))
}

/// Pool and counter sample (GET /operators/stats)
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.stats().await;
    let metrics = state.metrics.snapshot();
    Json(serde_json::json!({
        "pool": pool,
        "metrics": metrics,
    }))
}

/// Health check endpoint (GET /health)
///
/// Components: job ledger, queue store, worker pool, completion
/// reconciliation backlog, API itself. Returns 503 when any component is
/// unhealthy.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    use std::collections::HashMap;

    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());
    components.insert(
        "ledger".to_string(),
        match state.repo.health_check().await {
            Ok(()) => "healthy".to_string(),
            Err(error) => format!("unhealthy: {error}"),
        },
    );
    components.insert(
        "queue".to_string(),
        match state.queue.health_check() {
            Ok(()) => "healthy".to_string(),
            Err(error) => format!("unhealthy: {error}"),
        },
    );
    components.insert(
        "pool".to_string(),
        if state.pool.is_healthy() {
            "healthy".to_string()
        } else {
            "unhealthy: executor quorum lost".to_string()
        },
    );
    // Jobs whose counters are fully accounted but that still sit in
    // DOWNLOADING lost their terminal write; the heartbeat tick repairs
    // them, so a persistent backlog here means reconciliation is not
    // keeping up.
    components.insert(
        "reconciliation".to_string(),
        match state.repo.find_by_status(crate::job::JobStatus::Downloading, 500).await {
            Ok(jobs) => {
                let stuck = jobs
                    .iter()
                    .filter(|job| {
                        job.total_tasks > 0
                            && job.completed_tasks + job.failed_tasks >= job.total_tasks
                    })
                    .count();
                if stuck == 0 {
                    "healthy".to_string()
                } else {
                    format!("unhealthy: {stuck} jobs awaiting terminal write")
                }
            }
            Err(error) => format!("unhealthy: {error}"),
        },
    );

    let all_healthy = components.values().all(|status| status == "healthy");
    let status_code = if all_healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "unhealthy" }.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}
