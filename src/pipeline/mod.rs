//! Streaming file pipeline
//!
//! One pass per artifact: HTTP download, incremental checksum, byte count,
//! multipart upload. Memory stays bounded by the upload part size no matter
//! how large the artifact is. Any failure aborts the multipart upload so a
//! partial object is never committed under the output key.

mod hash;

pub use hash::{ChecksumAlgorithm, ChecksumError, ChecksumHint, StreamingDigest};

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use object_store::{MultipartUpload, PutPayload};
use thiserror::Error;
use tracing::{debug, warn};

use crate::job::ExportTask;
use crate::storage::StorageClient;

/// Hard ceiling on artifact size; a length of exactly this value passes.
pub const MAX_ARTIFACT_BYTES: u64 = 5 * 1024 * 1024 * 1024;

const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("download failed: {message}")]
    DownloadFailed {
        message: String,
        status: Option<u16>,
        retryable: bool,
    },

    #[error("artifact of {actual} bytes exceeds the {limit} byte limit")]
    SizeExceeded { limit: u64, actual: u64 },

    #[error("size mismatch: expected {expected} bytes, observed {actual}")]
    SizeMismatch {
        expected: u64,
        actual: u64,
        retryable: bool,
    },

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("invalid transfer input: {0}")]
    InvalidInput(String),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::DownloadFailed { retryable, .. } => *retryable,
            TransferError::SizeExceeded { .. } => false,
            TransferError::SizeMismatch { retryable, .. } => *retryable,
            // Truncated or corrupted stream reads as a network hazard.
            TransferError::ChecksumMismatch { .. } => true,
            TransferError::UploadFailed(_) => true,
            TransferError::InvalidInput(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferLimits {
    pub max_artifact_bytes: u64,
    pub part_size: usize,
    pub download_timeout: Duration,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_artifact_bytes: MAX_ARTIFACT_BYTES,
            part_size: DEFAULT_PART_SIZE,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub download_url: String,
    pub output_key: String,
    pub expected_size: Option<u64>,
    /// `algo:hex` checksum hint.
    pub checksum: Option<String>,
}

impl From<&ExportTask> for TransferRequest {
    fn from(task: &ExportTask) -> Self {
        Self {
            download_url: task.download_url.clone(),
            output_key: task.output_key.clone(),
            expected_size: task.file_size,
            checksum: task.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub uploaded_key: String,
    pub bytes: u64,
    pub duration_ms: u64,
}

/// Executes single-pass artifact transfers on whatever executor calls it.
pub struct TransferPipeline {
    client: reqwest::Client,
    storage: Arc<StorageClient>,
    limits: TransferLimits,
}

impl TransferPipeline {
    pub fn new(storage: Arc<StorageClient>, limits: TransferLimits) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(limits.download_timeout)
            .build()
            .map_err(|e| TransferError::InvalidInput(format!("http client: {e}")))?;
        Ok(Self {
            client,
            storage,
            limits,
        })
    }

    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let started = Instant::now();

        let checksum = request
            .checksum
            .as_deref()
            .map(ChecksumHint::parse)
            .transpose()
            .map_err(|e| TransferError::InvalidInput(e.to_string()))?;

        let response = self
            .client
            .get(&request.download_url)
            .send()
            .await
            .map_err(|e| TransferError::DownloadFailed {
                message: e.to_string(),
                status: None,
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::DownloadFailed {
                message: format!("{} returned HTTP {}", request.download_url, status.as_u16()),
                status: Some(status.as_u16()),
                retryable: status.is_server_error(),
            });
        }

        let advertised = response.content_length();
        if let Some(length) = advertised {
            if length > self.limits.max_artifact_bytes {
                return Err(TransferError::SizeExceeded {
                    limit: self.limits.max_artifact_bytes,
                    actual: length,
                });
            }
            if let Some(expected) = request.expected_size {
                if expected != length {
                    return Err(TransferError::SizeMismatch {
                        expected,
                        actual: length,
                        retryable: false,
                    });
                }
            }
        }

        let mut upload = self
            .storage
            .put_multipart(&request.output_key)
            .await
            .map_err(|e| TransferError::UploadFailed(e.to_string()))?;

        match self
            .stream_body(response, upload.as_mut(), checksum, advertised, request)
            .await
        {
            Ok(bytes) => {
                upload
                    .complete()
                    .await
                    .map_err(|e| TransferError::UploadFailed(e.to_string()))?;
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!(
                    key = %request.output_key,
                    bytes,
                    duration_ms,
                    "Artifact transferred"
                );
                Ok(TransferReceipt {
                    uploaded_key: request.output_key.clone(),
                    bytes,
                    duration_ms,
                })
            }
            Err(error) => {
                if let Err(abort_error) = upload.abort().await {
                    warn!(
                        key = %request.output_key,
                        error = %abort_error,
                        "Failed to abort multipart upload"
                    );
                }
                Err(error)
            }
        }
    }

    async fn stream_body(
        &self,
        response: reqwest::Response,
        upload: &mut dyn MultipartUpload,
        checksum: Option<ChecksumHint>,
        advertised: Option<u64>,
        request: &TransferRequest,
    ) -> Result<u64, TransferError> {
        let mut digest = checksum
            .as_ref()
            .map(|hint| StreamingDigest::new(hint.algorithm));
        let mut total: u64 = 0;
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::DownloadFailed {
                message: format!("body read failed: {e}"),
                status: None,
                retryable: true,
            })?;

            total += chunk.len() as u64;
            if total > self.limits.max_artifact_bytes {
                return Err(TransferError::SizeExceeded {
                    limit: self.limits.max_artifact_bytes,
                    actual: total,
                });
            }

            if let Some(digest) = digest.as_mut() {
                digest.update(&chunk);
            }
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= self.limits.part_size {
                let rest = buffer.split_off(self.limits.part_size);
                let part = mem::replace(&mut buffer, rest);
                upload
                    .put_part(PutPayload::from(part))
                    .await
                    .map_err(|e| TransferError::UploadFailed(e.to_string()))?;
            }
        }

        if !buffer.is_empty() {
            upload
                .put_part(PutPayload::from(buffer))
                .await
                .map_err(|e| TransferError::UploadFailed(e.to_string()))?;
        }

        // A short or long body against the advertised length is a transport
        // hazard; against a caller expectation (no advertised length) it is
        // a hard mismatch.
        if let Some(length) = advertised {
            if total != length {
                return Err(TransferError::SizeMismatch {
                    expected: length,
                    actual: total,
                    retryable: true,
                });
            }
        } else if let Some(expected) = request.expected_size {
            if total != expected {
                return Err(TransferError::SizeMismatch {
                    expected,
                    actual: total,
                    retryable: false,
                });
            }
        }

        if let (Some(hint), Some(digest)) = (checksum, digest) {
            let actual = digest.finalize();
            if actual != hint.expected {
                return Err(TransferError::ChecksumMismatch {
                    expected: hint.expected,
                    actual,
                });
            }
        }

        Ok(total)
    }
}

#[async_trait::async_trait]
impl crate::pool::TaskRunner for TransferPipeline {
    async fn run(&self, task: &ExportTask) -> Result<TransferReceipt, TransferError> {
        self.transfer(&TransferRequest::from(task)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(TransferError::DownloadFailed {
            message: "".into(),
            status: Some(503),
            retryable: true
        }
        .is_retryable());
        assert!(!TransferError::DownloadFailed {
            message: "".into(),
            status: Some(404),
            retryable: false
        }
        .is_retryable());
        assert!(!TransferError::SizeExceeded { limit: 1, actual: 2 }.is_retryable());
        assert!(TransferError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
        assert!(TransferError::UploadFailed("s3 500".into()).is_retryable());
        assert!(!TransferError::InvalidInput("bad hint".into()).is_retryable());
    }

    #[test]
    fn request_from_task_carries_hints() {
        let task = ExportTask::new(
            "j1",
            2,
            "https://cdn/x.bin",
            "x.bin",
            Some(99),
            Some("md5:aa".into()),
        );
        let request = TransferRequest::from(&task);
        assert_eq!(request.output_key, "j1/2_x.bin");
        assert_eq!(request.expected_size, Some(99));
        assert_eq!(request.checksum.as_deref(), Some("md5:aa"));
    }

    #[test]
    fn default_limits_match_contract() {
        let limits = TransferLimits::default();
        assert_eq!(limits.max_artifact_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(limits.part_size, 8 * 1024 * 1024);
        assert_eq!(limits.download_timeout, Duration::from_secs(300));
    }
}
