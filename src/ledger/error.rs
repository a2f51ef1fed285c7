use thiserror::Error;

use crate::job::JobError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// True for infrastructure faults worth retrying; domain rejections
    /// (invalid transitions, terminal state, unknown job) are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Fjall(_) | LedgerError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
