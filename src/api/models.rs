//! Operator endpoint payloads
//!
//! The service has no synchronous client API; jobs arrive over the message
//! queue. These models back the operator-facing read surface: health and
//! per-job inspection.

use serde::Serialize;
use std::collections::HashMap;

use crate::job::ExportJob;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}

/// Job record plus the derived read-side quantities.
#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: ExportJob,
    pub pending_tasks: u32,
    pub progress_percentage: u32,
}

impl From<ExportJob> for JobView {
    fn from(job: ExportJob) -> Self {
        let pending_tasks = job.pending_tasks();
        let progress_percentage = job.progress_percentage();
        Self {
            job,
            pending_tasks,
            progress_percentage,
        }
    }
}
