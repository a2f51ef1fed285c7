//! Export provider contract
//!
//! The provider prepares exports asynchronously; the service only ever
//! observes it through this trait. Statuses map onto the job lifecycle:
//! `Ready` starts the download fan-out, `Failed`/`Expired` terminate the
//! job, anything else keeps it enrolled for polling.

mod http;

pub use http::HttpExportProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("export {0} not found")]
    NotFound(String),

    #[error("provider request failed: {message}")]
    Request { message: String, retryable: bool },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::NotFound(_) => false,
            ProviderError::Request { retryable, .. } => *retryable,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Status reported by the provider for one export.
///
/// Unrecognized values land in `Unknown` and are handled like `Pending`, so
/// a provider rolling out new states never breaks intake or polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    Pending,
    Processing,
    Ready,
    Failed,
    Expired,
    #[serde(other)]
    Unknown,
}

impl ProviderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Ready | ProviderStatus::Failed | ProviderStatus::Expired
        )
    }
}

/// One downloadable artifact advertised by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrlInfo {
    pub url: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// `algo:hex` hint, e.g. `sha256:deadbeef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatusResponse {
    pub status: ProviderStatus,
    #[serde(default)]
    pub download_urls: Vec<DownloadUrlInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExportRequest {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExportResponse {
    pub export_id: String,
    pub status: ProviderStatus,
}

#[async_trait]
pub trait ExportProvider: Send + Sync {
    async fn start_export(&self, request: &StartExportRequest) -> Result<StartExportResponse>;

    async fn get_export_status(&self, export_id: &str) -> Result<ExportStatusResponse>;

    /// Best-effort; callers treat failures as advisory.
    async fn cancel_export(&self, export_id: &str) -> Result<()>;
}
