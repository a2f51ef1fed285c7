use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use super::task::ExportTask;

pub const DEFAULT_MAX_POLLING_ATTEMPTS: u32 = 120;
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job {job_id} is terminal ({status}), mutation rejected")]
    TerminalState { job_id: String, status: JobStatus },

    #[error("counter overflow: {completed} completed + {failed} failed exceeds {total} total")]
    CounterOverflow { completed: u32, failed: u32, total: u32 },

    #[error("task {task_id} belongs to job {task_job_id}, not {job_id}")]
    ForeignTask {
        task_id: String,
        task_job_id: String,
        job_id: String,
    },
}

/// Job lifecycle status. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Polling,
    Downloading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed forward moves. Any non-terminal status may also move to
    /// `Failed`; that is handled separately so the table stays small.
    fn can_advance_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Polling)
                | (Processing, Downloading)
                | (Polling, Downloading)
                | (Downloading, Completed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Polling => "POLLING",
            JobStatus::Downloading => "DOWNLOADING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Parameters for [`ExportJob::create`].
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub job_id: String,
    pub export_id: String,
    pub user_id: String,
    pub metadata: BTreeMap<String, Value>,
    pub callback_token: Option<String>,
    pub max_polling_attempts: Option<u32>,
    pub polling_interval_ms: Option<u64>,
}

/// One export request tracked end-to-end.
///
/// The record is immutable in spirit: transition and counter methods
/// validate, then return an updated copy. Persisted mutations go through the
/// repository, which applies these same methods under its writer lock and
/// hands back the post-update view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub job_id: String,
    pub export_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub callback_token: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub max_polling_attempts: u32,
    pub polling_interval_ms: u64,
    #[serde(default)]
    pub tasks: Vec<ExportTask>,
}

impl ExportJob {
    pub fn create(params: NewJob) -> Result<Self, JobError> {
        if params.job_id.trim().is_empty() {
            return Err(JobError::Validation("job_id must not be empty".into()));
        }
        if params.export_id.trim().is_empty() {
            return Err(JobError::Validation("export_id must not be empty".into()));
        }
        if params.user_id.trim().is_empty() {
            return Err(JobError::Validation("user_id must not be empty".into()));
        }
        let max_polling_attempts = params
            .max_polling_attempts
            .unwrap_or(DEFAULT_MAX_POLLING_ATTEMPTS);
        if max_polling_attempts == 0 {
            return Err(JobError::Validation(
                "max_polling_attempts must be positive".into(),
            ));
        }
        let polling_interval_ms = params
            .polling_interval_ms
            .unwrap_or(DEFAULT_POLLING_INTERVAL_MS);
        if polling_interval_ms == 0 {
            return Err(JobError::Validation(
                "polling_interval_ms must be positive".into(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            job_id: params.job_id,
            export_id: params.export_id,
            user_id: params.user_id,
            status: JobStatus::Pending,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
            callback_token: params.callback_token,
            metadata: params.metadata,
            max_polling_attempts,
            polling_interval_ms,
            tasks: Vec::new(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn pending_tasks(&self) -> u32 {
        self.total_tasks
            .saturating_sub(self.completed_tasks + self.failed_tasks)
    }

    pub fn progress_percentage(&self) -> u32 {
        let done = self.completed_tasks + self.failed_tasks;
        done * 100 / self.total_tasks.max(1)
    }

    /// True when every dispatched task has reported an outcome.
    pub fn all_tasks_accounted(&self) -> bool {
        self.completed_tasks + self.failed_tasks == self.total_tasks
    }

    fn ensure_live(&self) -> Result<(), JobError> {
        if self.is_terminal() {
            return Err(JobError::TerminalState {
                job_id: self.job_id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn advanced(&self, to: JobStatus) -> Result<Self, JobError> {
        self.ensure_live()?;
        if !self.status.can_advance_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let mut next = self.clone();
        next.status = to;
        next.updated_at = Utc::now();
        Ok(next)
    }

    pub fn transition_to_processing(&self) -> Result<Self, JobError> {
        self.advanced(JobStatus::Processing)
    }

    pub fn transition_to_polling(&self) -> Result<Self, JobError> {
        self.advanced(JobStatus::Polling)
    }

    pub fn transition_to_downloading(&self) -> Result<Self, JobError> {
        self.advanced(JobStatus::Downloading)
    }

    /// Move to `Completed`. Requires every task to be accounted for; the
    /// counter-driven completion check additionally requires a non-zero
    /// denominator before calling this (an explicit empty dispatch completes
    /// with zero tasks).
    pub fn transition_to_completed(&self) -> Result<Self, JobError> {
        if !self.all_tasks_accounted() {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Completed,
            });
        }
        let mut next = self.advanced(JobStatus::Completed)?;
        next.completed_at = Some(next.updated_at);
        Ok(next)
    }

    /// Move to `Failed` from any non-terminal status, recording the reason.
    pub fn transition_to_failed(&self, message: &str) -> Result<Self, JobError> {
        self.ensure_live()?;
        let mut next = self.clone();
        next.status = JobStatus::Failed;
        next.error_message = Some(message.to_string());
        next.updated_at = Utc::now();
        Ok(next)
    }

    pub fn increment_completed(&self) -> Result<Self, JobError> {
        self.ensure_live()?;
        self.checked_counters(self.completed_tasks + 1, self.failed_tasks)?;
        let mut next = self.clone();
        next.completed_tasks += 1;
        next.updated_at = Utc::now();
        Ok(next)
    }

    pub fn increment_failed(&self, error: Option<&str>) -> Result<Self, JobError> {
        self.ensure_live()?;
        self.checked_counters(self.completed_tasks, self.failed_tasks + 1)?;
        let mut next = self.clone();
        next.failed_tasks += 1;
        if let Some(message) = error {
            next.error_message = Some(message.to_string());
        }
        next.updated_at = Utc::now();
        Ok(next)
    }

    pub fn set_total_tasks(&self, n: u32) -> Result<Self, JobError> {
        self.ensure_live()?;
        if self.completed_tasks + self.failed_tasks > n {
            return Err(JobError::CounterOverflow {
                completed: self.completed_tasks,
                failed: self.failed_tasks,
                total: n,
            });
        }
        let mut next = self.clone();
        next.total_tasks = n;
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// Record the task split exactly once: stores the task set and sets the
    /// completion denominator in the same step. Tasks carrying another job's
    /// id are rejected.
    pub fn with_tasks(&self, tasks: Vec<ExportTask>) -> Result<Self, JobError> {
        self.ensure_live()?;
        for task in &tasks {
            if task.job_id != self.job_id {
                return Err(JobError::ForeignTask {
                    task_id: task.task_id.clone(),
                    task_job_id: task.job_id.clone(),
                    job_id: self.job_id.clone(),
                });
            }
        }
        let total = tasks.len() as u32;
        let mut next = self.set_total_tasks(total)?;
        next.tasks = tasks;
        Ok(next)
    }

    fn checked_counters(&self, completed: u32, failed: u32) -> Result<(), JobError> {
        if completed + failed > self.total_tasks {
            return Err(JobError::CounterOverflow {
                completed,
                failed,
                total: self.total_tasks,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(job_id: &str) -> ExportJob {
        ExportJob::create(NewJob {
            job_id: job_id.to_string(),
            export_id: "export-1".to_string(),
            user_id: "user-1".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn task(job_id: &str, index: usize) -> ExportTask {
        ExportTask::new(
            job_id,
            index,
            "https://cdn.example.com/file.bin",
            "file.bin",
            None,
            None,
        )
    }

    #[test]
    fn create_rejects_empty_identifiers() {
        let result = ExportJob::create(NewJob {
            job_id: "".to_string(),
            export_id: "e".to_string(),
            user_id: "u".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(JobError::Validation(_))));

        let result = ExportJob::create(NewJob {
            job_id: "j".to_string(),
            export_id: "  ".to_string(),
            user_id: "u".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(JobError::Validation(_))));
    }

    #[test]
    fn create_applies_polling_defaults() {
        let job = new_job("j1");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_polling_attempts, DEFAULT_MAX_POLLING_ATTEMPTS);
        assert_eq!(job.polling_interval_ms, DEFAULT_POLLING_INTERVAL_MS);
        assert_eq!(job.total_tasks, 0);
    }

    #[test]
    fn create_rejects_zero_polling_attempts() {
        let result = ExportJob::create(NewJob {
            job_id: "j".to_string(),
            export_id: "e".to_string(),
            user_id: "u".to_string(),
            max_polling_attempts: Some(0),
            ..Default::default()
        });
        assert!(matches!(result, Err(JobError::Validation(_))));
    }

    #[test]
    fn happy_path_transitions() {
        let job = new_job("j1");
        let job = job.transition_to_processing().unwrap();
        let job = job.transition_to_downloading().unwrap();
        let job = job.with_tasks(vec![task("j1", 0)]).unwrap();
        let job = job.increment_completed().unwrap();
        let job = job.transition_to_completed().unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.completed_tasks, 1);
    }

    #[test]
    fn polling_detour_transitions() {
        let job = new_job("j1").transition_to_processing().unwrap();
        let job = job.transition_to_polling().unwrap();
        let job = job.transition_to_downloading().unwrap();
        assert_eq!(job.status, JobStatus::Downloading);
    }

    #[test]
    fn skipping_states_is_rejected() {
        let job = new_job("j1");
        assert!(matches!(
            job.transition_to_downloading(),
            Err(JobError::InvalidTransition { .. })
        ));
        assert!(matches!(
            job.transition_to_completed(),
            Err(JobError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn completion_requires_all_tasks_accounted() {
        let job = new_job("j1")
            .transition_to_processing()
            .unwrap()
            .transition_to_downloading()
            .unwrap()
            .with_tasks(vec![task("j1", 0), task("j1", 1)])
            .unwrap();
        let job = job.increment_completed().unwrap();
        assert!(matches!(
            job.transition_to_completed(),
            Err(JobError::InvalidTransition { .. })
        ));

        let job = job.increment_failed(Some("boom")).unwrap();
        let job = job.transition_to_completed().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.failed_tasks, 1);
    }

    #[test]
    fn failure_allowed_from_any_live_state() {
        let makes: [fn(ExportJob) -> ExportJob; 3] = [
            |j| j,
            |j| j.transition_to_processing().unwrap(),
            |j| {
                j.transition_to_processing()
                    .unwrap()
                    .transition_to_polling()
                    .unwrap()
            },
        ];
        for make in makes {
            let job = make(new_job("j1"));
            let failed = job.transition_to_failed("export expired").unwrap();
            assert_eq!(failed.status, JobStatus::Failed);
            assert_eq!(failed.error_message.as_deref(), Some("export expired"));
        }
    }

    #[test]
    fn terminal_states_reject_all_mutation() {
        let failed = new_job("j1").transition_to_failed("boom").unwrap();
        assert!(matches!(
            failed.increment_completed(),
            Err(JobError::TerminalState { .. })
        ));
        assert!(matches!(
            failed.transition_to_failed("again"),
            Err(JobError::TerminalState { .. })
        ));
        assert!(matches!(
            failed.set_total_tasks(3),
            Err(JobError::TerminalState { .. })
        ));
    }

    #[test]
    fn counters_never_exceed_total() {
        let job = new_job("j1")
            .transition_to_processing()
            .unwrap()
            .transition_to_downloading()
            .unwrap()
            .with_tasks(vec![task("j1", 0)])
            .unwrap();
        let job = job.increment_completed().unwrap();
        assert!(matches!(
            job.increment_completed(),
            Err(JobError::CounterOverflow { .. })
        ));
        assert!(matches!(
            job.increment_failed(None),
            Err(JobError::CounterOverflow { .. })
        ));
    }

    #[test]
    fn with_tasks_rejects_foreign_tasks() {
        let job = new_job("j1")
            .transition_to_processing()
            .unwrap()
            .transition_to_downloading()
            .unwrap();
        let result = job.with_tasks(vec![task("other-job", 0)]);
        assert!(matches!(result, Err(JobError::ForeignTask { .. })));
    }

    #[test]
    fn derived_quantities() {
        let job = new_job("j1")
            .transition_to_processing()
            .unwrap()
            .transition_to_downloading()
            .unwrap()
            .with_tasks(vec![task("j1", 0), task("j1", 1), task("j1", 2), task("j1", 3)])
            .unwrap();
        let job = job.increment_completed().unwrap();
        let job = job.increment_failed(None).unwrap();
        assert_eq!(job.pending_tasks(), 2);
        assert_eq!(job.progress_percentage(), 50);

        let empty = new_job("j2");
        assert_eq!(empty.progress_percentage(), 0);
        assert_eq!(empty.pending_tasks(), 0);
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&JobStatus::Downloading).unwrap();
        assert_eq!(json, "\"DOWNLOADING\"");
        let back: JobStatus = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(back, JobStatus::Completed);
    }
}
