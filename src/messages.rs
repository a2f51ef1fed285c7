//! Boundary message schemas
//!
//! JSON payloads crossing the two queue boundaries: export-job intake and
//! the download-task overflow. Validation happens before any state is
//! touched; invalid messages are acknowledged and dropped by the consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::job::ExportTask;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("field {field} must be a UUID, got {value:?}")]
    NotAUuid { field: &'static str, value: String },

    #[error("field {0} must not be empty")]
    Empty(&'static str),

    #[error("field {field} must be an absolute http(s) URL, got {value:?}")]
    BadUrl { field: &'static str, value: String },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Intake request for one export job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobMessage {
    pub job_id: String,
    pub export_id: String,
    pub user_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<String>,
}

impl ExportJobMessage {
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_str(body)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        require_uuid("jobId", &self.job_id)?;
        require_non_empty("exportId", &self.export_id)?;
        require_non_empty("userId", &self.user_id)?;
        Ok(())
    }
}

/// One artifact task serialized onto the overflow queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTaskMessage {
    pub task_id: String,
    pub job_id: String,
    pub export_id: String,
    pub download_url: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub output_key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl DownloadTaskMessage {
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_str(body)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        require_uuid("taskId", &self.task_id)?;
        require_uuid("jobId", &self.job_id)?;
        require_non_empty("exportId", &self.export_id)?;
        require_non_empty("fileName", &self.file_name)?;
        require_non_empty("outputKey", &self.output_key)?;
        require_absolute_url("downloadUrl", &self.download_url)?;
        Ok(())
    }

    pub fn from_task(task: &ExportTask, export_id: &str) -> Self {
        Self {
            task_id: task.task_id.clone(),
            job_id: task.job_id.clone(),
            export_id: export_id.to_string(),
            download_url: task.download_url.clone(),
            file_name: task.file_name.clone(),
            file_size: task.file_size,
            checksum: task.checksum.clone(),
            output_key: task.output_key.clone(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn into_task(self) -> ExportTask {
        ExportTask {
            task_id: self.task_id,
            job_id: self.job_id,
            download_url: self.download_url,
            file_name: self.file_name,
            file_size: self.file_size,
            checksum: self.checksum,
            output_key: self.output_key,
        }
    }
}

fn require_uuid(field: &'static str, value: &str) -> Result<(), MessageError> {
    Uuid::parse_str(value).map_err(|_| MessageError::NotAUuid {
        field,
        value: value.to_string(),
    })?;
    Ok(())
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), MessageError> {
    if value.trim().is_empty() {
        return Err(MessageError::Empty(field));
    }
    Ok(())
}

fn require_absolute_url(field: &'static str, value: &str) -> Result<(), MessageError> {
    let parsed = url::Url::parse(value).map_err(|_| MessageError::BadUrl {
        field,
        value: value.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(MessageError::BadUrl {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
