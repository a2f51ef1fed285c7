use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::{CompletionAggregator, DispatchError, TaskDispatcher};
use crate::events::{Event, EventSink};
use crate::job::{ExportJob, JobError, JobStatus, NewJob};
use crate::ledger::{JobRepository, LedgerError, StatusPatch};
use crate::messages::ExportJobMessage;
use crate::observability::Metrics;
use crate::polling::PollingService;
use crate::provider::{ExportProvider, ProviderError, ProviderStatus};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// What intake decided for a freshly created job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeOutcome {
    pub needs_polling: bool,
    pub can_start_downloading: bool,
}

impl IntakeOutcome {
    fn settled() -> Self {
        Self {
            needs_polling: false,
            can_start_downloading: false,
        }
    }
}

/// Turns a validated job message into a persisted job and routes it by the
/// provider's current answer: straight to dispatch, into the polling set,
/// or to a terminal failure.
pub struct IntakeHandler {
    repo: Arc<dyn JobRepository>,
    provider: Arc<dyn ExportProvider>,
    dispatcher: Arc<TaskDispatcher>,
    polling: Arc<PollingService>,
    completion: Arc<CompletionAggregator>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
}

impl IntakeHandler {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        provider: Arc<dyn ExportProvider>,
        dispatcher: Arc<TaskDispatcher>,
        polling: Arc<PollingService>,
        completion: Arc<CompletionAggregator>,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repo,
            provider,
            dispatcher,
            polling,
            completion,
            events,
            metrics,
        }
    }

    pub async fn handle(&self, message: &ExportJobMessage) -> Result<IntakeOutcome, IntakeError> {
        let job = ExportJob::create(NewJob {
            job_id: message.job_id.clone(),
            export_id: message.export_id.clone(),
            user_id: message.user_id.clone(),
            metadata: message.metadata.clone(),
            callback_token: message.callback_token.clone(),
            max_polling_attempts: None,
            polling_interval_ms: None,
        })?;

        match self.repo.save(&job).await {
            Ok(_) => {}
            // Redelivered message for a job we already took in; the earlier
            // delivery owns the lifecycle.
            Err(LedgerError::DuplicateJob(_)) => {
                warn!(job_id = %message.job_id, "Duplicate job message, already processed");
                return Ok(IntakeOutcome::settled());
            }
            Err(error) => return Err(error.into()),
        }

        self.metrics.job_received();
        info!(
            job_id = %job.job_id,
            export_id = %job.export_id,
            "Job accepted"
        );
        if let Err(error) = self
            .events
            .publish(Event::JobCreated {
                job_id: job.job_id.clone(),
                export_id: job.export_id.clone(),
                user_id: job.user_id.clone(),
            })
            .await
        {
            debug!(%error, "JobCreated publish failed");
        }

        self.repo
            .update_status(&job.job_id, JobStatus::Processing, StatusPatch::default())
            .await?;

        let status = match self.provider.get_export_status(&job.export_id).await {
            Ok(status) => status,
            Err(error) => {
                // Best-effort terminal mark, then surface the error so the
                // queue applies its own retry and DLQ policy.
                self.completion
                    .fail_job(&job.job_id, "ProviderError", &error.to_string())
                    .await;
                return Err(error.into());
            }
        };

        match status.status {
            ProviderStatus::Ready => {
                self.repo
                    .update_status(&job.job_id, JobStatus::Downloading, StatusPatch::default())
                    .await?;
                self.dispatcher
                    .dispatch(&job.job_id, &job.export_id, &status.download_urls)
                    .await?;
                Ok(IntakeOutcome {
                    needs_polling: false,
                    can_start_downloading: true,
                })
            }
            ProviderStatus::Failed => {
                let cause = status
                    .error_message
                    .unwrap_or_else(|| "export failed at the provider".to_string());
                self.completion
                    .fail_job(&job.job_id, "ExportFailed", &cause)
                    .await;
                Ok(IntakeOutcome::settled())
            }
            ProviderStatus::Expired => {
                let cause = status
                    .error_message
                    .unwrap_or_else(|| format!("export {} expired", job.export_id));
                self.completion
                    .fail_job(&job.job_id, "ExportExpired", &cause)
                    .await;
                Ok(IntakeOutcome::settled())
            }
            // Pending, Processing, and anything the provider invents later.
            _ => {
                self.repo
                    .update_status(&job.job_id, JobStatus::Polling, StatusPatch::default())
                    .await?;
                self.polling
                    .enroll(&job.job_id, &job.export_id, &job.user_id);
                Ok(IntakeOutcome {
                    needs_polling: true,
                    can_start_downloading: false,
                })
            }
        }
    }
}
