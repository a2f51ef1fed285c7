//! Bounded worker pool for artifact transfer tasks
//!
//! A fixed set of executors drains a FIFO backlog. Executors fail
//! independently: a panic mid-task fails only that task's future, and the
//! pool restores its size by spawning a replacement. All pool structures
//! are owned by a single coordinator task; callers interact through
//! commands and shared counters only.

mod coordinator;
mod executor;

pub use coordinator::{PoolConfig, WorkerPool};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::job::ExportTask;
use crate::pipeline::{TransferError, TransferReceipt};

/// Executes one task. The pool stays agnostic of what a task does; the
/// production runner is the streaming transfer pipeline.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &ExportTask) -> Result<TransferReceipt, TransferError>;
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("executor crashed while running the task")]
    ExecutorCrashed,

    #[error("worker pool shut down before the task ran")]
    PoolShutdown,
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Transfer(e) => e.is_retryable(),
            TaskError::ExecutorCrashed => true,
            TaskError::PoolShutdown => false,
        }
    }
}

pub type TaskOutcome = Result<TransferReceipt, TaskError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Backlog full and no idle executor; route the task to the overflow
    /// queue instead.
    #[error("worker pool saturated")]
    Saturated,

    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Future for one accepted task's outcome.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    receiver: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: String, receiver: oneshot::Receiver<TaskOutcome>) -> Self {
        Self { task_id, receiver }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn outcome(self) -> TaskOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            // The coordinator vanished mid-flight; indistinguishable from a
            // crashed executor for the caller.
            Err(_) => Err(TaskError::ExecutorCrashed),
        }
    }
}

/// Read-only pool health sample.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub active: usize,
    pub idle: usize,
    pub queue_length: usize,
    pub live_executors: usize,
    pub completed: u64,
    pub failed: u64,
    pub average_duration_ms: u64,
    pub healthy: bool,
}
