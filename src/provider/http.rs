use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{
    ExportProvider, ExportStatusResponse, ProviderError, Result, StartExportRequest,
    StartExportResponse,
};

/// HTTP client for the export provider API.
///
/// Uses one pooled, keep-alive connection set for all jobs; each call
/// carries the configured status timeout.
pub struct HttpExportProvider {
    client: Client,
    base_url: String,
}

impl HttpExportProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Request {
                message: format!("failed to build provider client: {e}"),
                retryable: false,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Request {
        message: e.to_string(),
        retryable: true,
    }
}

fn status_error(export_id: &str, status: StatusCode) -> ProviderError {
    if status == StatusCode::NOT_FOUND {
        return ProviderError::NotFound(export_id.to_string());
    }
    ProviderError::Request {
        message: format!("provider returned HTTP {}", status.as_u16()),
        retryable: status.is_server_error(),
    }
}

#[async_trait]
impl ExportProvider for HttpExportProvider {
    async fn start_export(&self, request: &StartExportRequest) -> Result<StartExportResponse> {
        let response = self
            .client
            .post(self.url("/exports"))
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("", status));
        }
        response.json().await.map_err(transport_error)
    }

    async fn get_export_status(&self, export_id: &str) -> Result<ExportStatusResponse> {
        debug!(export_id, "Fetching export status");
        let response = self
            .client
            .get(self.url(&format!("/exports/{export_id}/status")))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(export_id, status));
        }
        response.json().await.map_err(transport_error)
    }

    async fn cancel_export(&self, export_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/exports/{export_id}/cancel")))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(export_id, status));
        }
        Ok(())
    }
}
