use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::events::{Event, EventSink};
use crate::job::{ExportJob, JobError, JobStatus};
use crate::ledger::{JobRepository, LedgerError, StatusPatch};
use crate::observability::Metrics;
use crate::pipeline::TransferReceipt;
use crate::pool::TaskOutcome;
use crate::workflow::{TaskCounters, WorkflowEngine, WorkflowFailure, WorkflowSuccess};

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Counts per-task outcomes and closes jobs out.
///
/// Counter updates go through the repository's atomic increments, so
/// exactly one recorded outcome observes the sum reach the total and
/// performs the terminal transition. The workflow callback rides on that
/// transition succeeding, which bounds it to at most once per job.
pub struct CompletionAggregator {
    repo: Arc<dyn JobRepository>,
    workflow: Arc<dyn WorkflowEngine>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
}

impl CompletionAggregator {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        workflow: Arc<dyn WorkflowEngine>,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repo,
            workflow,
            events,
            metrics,
        }
    }

    pub async fn record_outcome(&self, job_id: &str, task_id: &str, outcome: &TaskOutcome) {
        match outcome {
            Ok(receipt) => self.record_success(job_id, task_id, receipt).await,
            Err(error) => self.record_failure(job_id, task_id, &error.to_string()).await,
        }
    }

    pub async fn record_success(&self, job_id: &str, task_id: &str, receipt: &TransferReceipt) {
        let view = match self.repo.increment_completed_tasks(job_id).await {
            Ok(view) => view,
            Err(error) => return self.swallow_increment_error(job_id, task_id, error),
        };
        self.metrics.task_completed();
        debug!(
            job_id,
            task_id,
            key = %receipt.uploaded_key,
            bytes = receipt.bytes,
            "Task completed"
        );
        self.publish(Event::TaskCompleted {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
        })
        .await;
        self.maybe_complete(&view).await;
    }

    pub async fn record_failure(&self, job_id: &str, task_id: &str, message: &str) {
        let view = match self
            .repo
            .increment_failed_tasks(job_id, Some(message))
            .await
        {
            Ok(view) => view,
            Err(error) => return self.swallow_increment_error(job_id, task_id, error),
        };
        self.metrics.task_failed();
        warn!(job_id, task_id, error = message, "Task failed");
        self.publish(Event::TaskFailed {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            error_message: message.to_string(),
        })
        .await;
        self.maybe_complete(&view).await;
    }

    /// Counter-driven completion rule: all tasks accounted for and a
    /// non-zero denominator. Zero-task jobs complete only through the
    /// explicit [`CompletionAggregator::finalize`] on empty dispatch.
    async fn maybe_complete(&self, view: &ExportJob) {
        if view.total_tasks > 0 && view.all_tasks_accounted() {
            self.finalize(view).await;
        }
    }

    /// Terminal status writes retry through transient store faults; the
    /// counters backing the transition are already persisted, so giving up
    /// here leaves a fully-accounted job for the heartbeat reconciliation
    /// pass to repair.
    async fn update_terminal_status(
        &self,
        job_id: &str,
        status: JobStatus,
        patch: StatusPatch,
    ) -> std::result::Result<ExportJob, LedgerError> {
        let mut attempt = 0u32;
        loop {
            match self.repo.update_status(job_id, status, patch.clone()).await {
                Ok(job) => return Ok(job),
                Err(error) if error.is_transient() && attempt + 1 < TERMINAL_WRITE_ATTEMPTS => {
                    attempt += 1;
                    warn!(job_id, %error, attempt, "Terminal status write failed, retrying");
                    tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                }
                Err(error) => {
                    if error.is_transient() {
                        self.metrics.ledger_write_failed();
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Move the job to `COMPLETED` and emit the success callback.
    /// Idempotent: losing the transition race (job already terminal) is a
    /// quiet no-op, so the callback fires at most once.
    pub async fn finalize(&self, view: &ExportJob) {
        let completed = match self
            .update_terminal_status(&view.job_id, JobStatus::Completed, StatusPatch::default())
            .await
        {
            Ok(job) => job,
            Err(LedgerError::Job(JobError::TerminalState { .. })) => {
                debug!(job_id = %view.job_id, "Job already terminal, completion is a no-op");
                return;
            }
            Err(error) => {
                error!(
                    job_id = %view.job_id,
                    %error,
                    "Failed to complete job, heartbeat reconciliation will retry"
                );
                return;
            }
        };

        self.metrics.job_completed();
        self.publish(Event::JobCompleted {
            job_id: completed.job_id.clone(),
            completed_tasks: completed.completed_tasks,
            failed_tasks: completed.failed_tasks,
        })
        .await;
        self.send_success_callback(&completed).await;
    }

    /// Terminal failure path shared by intake and polling: `FAILED`
    /// transition, `JobFailed` event, failure callback if a token exists.
    pub async fn fail_job(&self, job_id: &str, error_name: &str, message: &str) {
        let view = match self
            .update_terminal_status(
                job_id,
                JobStatus::Failed,
                StatusPatch {
                    error_message: Some(message.to_string()),
                },
            )
            .await
        {
            Ok(view) => view,
            Err(LedgerError::Job(JobError::TerminalState { .. })) => {
                debug!(job_id, "Job already terminal, failure is a no-op");
                return;
            }
            Err(LedgerError::JobNotFound(_)) => {
                warn!(job_id, "Cannot fail unknown job");
                return;
            }
            Err(error) => {
                error!(job_id, %error, "Failed to mark job as failed, job left non-terminal");
                return;
            }
        };

        self.metrics.job_failed();
        self.publish(Event::JobFailed {
            job_id: job_id.to_string(),
            error_message: message.to_string(),
        })
        .await;

        if let Some(token) = &view.callback_token {
            let failure = WorkflowFailure {
                error: error_name.to_string(),
                cause: message.to_string(),
                job_id: Some(view.job_id.clone()),
                export_id: Some(view.export_id.clone()),
                counters: Some(TaskCounters {
                    total_tasks: view.total_tasks,
                    completed_tasks: view.completed_tasks,
                    failed_tasks: view.failed_tasks,
                }),
            };
            match self.workflow.send_task_failure(token, &failure).await {
                Ok(()) => self.metrics.callback_sent(),
                Err(error) => {
                    warn!(job_id, %error, "Failure callback failed, job state already persisted")
                }
            }
        }
    }

    async fn send_success_callback(&self, job: &ExportJob) {
        let Some(token) = &job.callback_token else {
            return;
        };
        let completed_at = job.completed_at.unwrap_or(job.updated_at);
        let duration_ms = (completed_at - job.created_at).num_milliseconds().max(0) as u64;
        let outputs = if job.tasks.is_empty() {
            None
        } else {
            Some(job.tasks.iter().map(|t| t.output_key.clone()).collect())
        };

        // Partial success still reports COMPLETED; the failed-task count
        // travels in the payload rather than as a workflow failure.
        let payload = WorkflowSuccess {
            job_id: job.job_id.clone(),
            export_id: job.export_id.clone(),
            user_id: job.user_id.clone(),
            status: job.status.to_string(),
            total_tasks: job.total_tasks,
            completed_tasks: job.completed_tasks,
            failed_tasks: job.failed_tasks,
            outputs,
            completed_at,
            duration_ms,
        };
        match self.workflow.send_task_success(token, &payload).await {
            Ok(()) => self.metrics.callback_sent(),
            Err(error) => {
                warn!(
                    job_id = %job.job_id,
                    %error,
                    "Success callback failed, job state already persisted"
                )
            }
        }
    }

    fn swallow_increment_error(&self, job_id: &str, task_id: &str, error: LedgerError) {
        match error {
            // Duplicate delivery after the job already closed: drop it, the
            // counters must not move again.
            LedgerError::Job(JobError::TerminalState { .. }) => {
                warn!(job_id, task_id, "Outcome for terminal job dropped")
            }
            LedgerError::JobNotFound(_) => {
                warn!(job_id, task_id, "Outcome for unknown job dropped")
            }
            error => error!(job_id, task_id, %error, "Failed to record task outcome"),
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(error) = self.events.publish(event).await {
            debug!(%error, "Event publish failed");
        }
    }
}
