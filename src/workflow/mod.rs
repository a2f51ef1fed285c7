//! Workflow engine callback contract
//!
//! A parent workflow hands the service a callback token with each job. The
//! service signals liveness through heartbeats while the job is active and
//! reports the terminal outcome exactly once. Callback failures never feed
//! back into job state.

mod http;

pub use http::HttpWorkflowEngine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The engine no longer knows the task behind this token (timed out or
    /// already closed). Heartbeats treat this as a warning, not a failure.
    #[error("workflow task for this token no longer exists")]
    TaskGone,

    #[error("callback failed: {0}")]
    CallbackFailed(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Success payload: terminal counters plus the produced object keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSuccess {
    pub job_id: String,
    pub export_id: String,
    pub user_id: String,
    pub status: String,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounters {
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowFailure {
    pub error: String,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<TaskCounters>,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn send_task_success(&self, token: &str, output: &WorkflowSuccess) -> Result<()>;

    async fn send_task_failure(&self, token: &str, failure: &WorkflowFailure) -> Result<()>;

    async fn send_task_heartbeat(&self, token: &str) -> Result<()>;
}

/// Recorded callback traffic, for tests.
#[derive(Debug, Clone)]
pub enum WorkflowCall {
    Success { token: String, output: WorkflowSuccess },
    Failure { token: String, failure: WorkflowFailure },
    Heartbeat { token: String },
}

/// Test double capturing every callback in order.
#[derive(Debug, Default)]
pub struct RecordingWorkflow {
    calls: Mutex<Vec<WorkflowCall>>,
}

impl RecordingWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<WorkflowCall> {
        self.calls.lock().expect("call log lock poisoned").clone()
    }

    pub fn successes(&self) -> Vec<WorkflowSuccess> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                WorkflowCall::Success { output, .. } => Some(output),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<WorkflowFailure> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                WorkflowCall::Failure { failure, .. } => Some(failure),
                _ => None,
            })
            .collect()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, WorkflowCall::Heartbeat { .. }))
            .count()
    }
}

#[async_trait]
impl WorkflowEngine for RecordingWorkflow {
    async fn send_task_success(&self, token: &str, output: &WorkflowSuccess) -> Result<()> {
        self.calls
            .lock()
            .expect("call log lock poisoned")
            .push(WorkflowCall::Success {
                token: token.to_string(),
                output: output.clone(),
            });
        Ok(())
    }

    async fn send_task_failure(&self, token: &str, failure: &WorkflowFailure) -> Result<()> {
        self.calls
            .lock()
            .expect("call log lock poisoned")
            .push(WorkflowCall::Failure {
                token: token.to_string(),
                failure: failure.clone(),
            });
        Ok(())
    }

    async fn send_task_heartbeat(&self, token: &str) -> Result<()> {
        self.calls
            .lock()
            .expect("call log lock poisoned")
            .push(WorkflowCall::Heartbeat {
                token: token.to_string(),
            });
        Ok(())
    }
}
