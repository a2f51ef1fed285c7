use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One artifact download+upload within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportTask {
    pub task_id: String,
    pub job_id: String,
    pub download_url: String,
    pub file_name: String,
    pub file_size: Option<u64>,
    /// Checksum hint in `algo:hex` form, e.g. `sha256:deadbeef`.
    pub checksum: Option<String>,
    pub output_key: String,
}

impl ExportTask {
    pub fn new(
        job_id: &str,
        index: usize,
        download_url: &str,
        file_name: &str,
        file_size: Option<u64>,
        checksum: Option<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            download_url: download_url.to_string(),
            file_name: file_name.to_string(),
            file_size,
            checksum,
            output_key: derive_output_key(job_id, index, file_name),
        }
    }
}

/// Stable object key layout: `{job_id}/{index}_{file_name}`.
pub fn derive_output_key(job_id: &str, index: usize, file_name: &str) -> String {
    format!("{}/{}_{}", job_id, index, file_name)
}
