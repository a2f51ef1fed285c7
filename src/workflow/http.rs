use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::debug;

use super::{Result, WorkflowEngine, WorkflowError, WorkflowFailure, WorkflowSuccess};

/// HTTP client for the workflow engine's callback endpoints.
pub struct HttpWorkflowEngine {
    client: Client,
    base_url: String,
}

impl HttpWorkflowEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkflowError::CallbackFailed(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| WorkflowError::CallbackFailed(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // The engine reports an unknown or timed-out task token with 410.
            StatusCode::GONE | StatusCode::NOT_FOUND => Err(WorkflowError::TaskGone),
            status => Err(WorkflowError::CallbackFailed(format!(
                "workflow engine returned HTTP {}",
                status.as_u16()
            ))),
        }
    }
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    async fn send_task_success(&self, token: &str, output: &WorkflowSuccess) -> Result<()> {
        debug!(job_id = %output.job_id, "Sending workflow success callback");
        self.post(
            "/tasks/success",
            json!({ "taskToken": token, "output": output }),
        )
        .await
    }

    async fn send_task_failure(&self, token: &str, failure: &WorkflowFailure) -> Result<()> {
        debug!(error = %failure.error, "Sending workflow failure callback");
        self.post(
            "/tasks/failure",
            json!({ "taskToken": token, "error": failure.error, "cause": failure }),
        )
        .await
    }

    async fn send_task_heartbeat(&self, token: &str) -> Result<()> {
        self.post("/tasks/heartbeat", json!({ "taskToken": token }))
            .await
    }
}
