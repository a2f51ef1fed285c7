//! Export status polling
//!
//! One scheduler drives every enrolled job off a single global tick. Each
//! tick polls all enrolled exports in parallel, with a per-job attempt
//! budget taken from the job record at enrolment. Only a terminal provider
//! status or attempt exhaustion removes a job from the set; transient
//! provider errors keep it enrolled and never reset the counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::dispatch::{CompletionAggregator, TaskDispatcher};
use crate::job::JobStatus;
use crate::ledger::{JobRepository, StatusPatch};
use crate::provider::{ExportProvider, ProviderStatus};

#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Global tick period; per-job intervals can only shorten it, at
    /// enrolment.
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(crate::job::DEFAULT_POLLING_INTERVAL_MS),
        }
    }
}

enum PollCommand {
    Enroll {
        job_id: String,
        export_id: String,
        user_id: String,
    },
    Unenroll {
        job_id: String,
    },
    ActiveJobs {
        reply: oneshot::Sender<Vec<String>>,
    },
}

struct PollEntry {
    export_id: String,
    user_id: String,
    attempts: u32,
    max_attempts: u32,
}

/// Handle to the polling scheduler. The entry table lives inside the
/// scheduler task; these operations only send commands.
pub struct PollingService {
    commands: mpsc::UnboundedSender<PollCommand>,
    active: Arc<AtomicUsize>,
}

impl PollingService {
    pub fn start(
        config: PollingConfig,
        repo: Arc<dyn JobRepository>,
        provider: Arc<dyn ExportProvider>,
        dispatcher: Arc<TaskDispatcher>,
        completion: Arc<CompletionAggregator>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicUsize::new(0));

        let scheduler = Scheduler {
            period: config.interval,
            repo,
            provider,
            dispatcher,
            completion,
            commands: commands_rx,
            entries: HashMap::new(),
            active: active.clone(),
        };
        tokio::spawn(scheduler.run(shutdown));

        Arc::new(Self {
            commands: commands_tx,
            active,
        })
    }

    /// Idempotent: enrolling an already-enrolled job is a warned no-op.
    pub fn enroll(&self, job_id: &str, export_id: &str, user_id: &str) {
        let _ = self.commands.send(PollCommand::Enroll {
            job_id: job_id.to_string(),
            export_id: export_id.to_string(),
            user_id: user_id.to_string(),
        });
    }

    pub fn unenroll(&self, job_id: &str) {
        let _ = self.commands.send(PollCommand::Unenroll {
            job_id: job_id.to_string(),
        });
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn active_jobs(&self) -> Vec<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(PollCommand::ActiveJobs { reply: reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

struct Scheduler {
    period: Duration,
    repo: Arc<dyn JobRepository>,
    provider: Arc<dyn ExportProvider>,
    dispatcher: Arc<TaskDispatcher>,
    completion: Arc<CompletionAggregator>,
    commands: mpsc::UnboundedReceiver<PollCommand>,
    entries: HashMap<String, PollEntry>,
    active: Arc<AtomicUsize>,
}

enum PollVerdict {
    Keep,
    Done,
}

impl Scheduler {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick completes immediately; skip it so a job
        // enrolled now is not polled before one period elapses.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(command) = self.commands.recv() => {
                    if let Some(new_period) = self.handle_command(command).await {
                        ticker = tokio::time::interval(new_period);
                        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        ticker.tick().await;
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
        debug!("Polling scheduler stopped");
    }

    /// Returns a new period when an enrolment shortens the global tick.
    async fn handle_command(&mut self, command: PollCommand) -> Option<Duration> {
        match command {
            PollCommand::Enroll {
                job_id,
                export_id,
                user_id,
            } => {
                if self.entries.contains_key(&job_id) {
                    warn!(job_id, "Job already enrolled for polling");
                    return None;
                }
                let job = match self.repo.find_by_id(&job_id).await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        warn!(job_id, "Cannot enroll unknown job for polling");
                        return None;
                    }
                    Err(error) => {
                        error!(job_id, %error, "Failed to load job for polling enrolment");
                        return None;
                    }
                };

                info!(job_id, export_id, user_id, "Job enrolled for polling");
                self.entries.insert(
                    job_id,
                    PollEntry {
                        export_id,
                        user_id,
                        attempts: 0,
                        max_attempts: job.max_polling_attempts,
                    },
                );
                self.publish_active();

                let job_interval = Duration::from_millis(job.polling_interval_ms);
                if job_interval < self.period {
                    self.period = job_interval;
                    return Some(job_interval);
                }
                None
            }
            PollCommand::Unenroll { job_id } => {
                if self.entries.remove(&job_id).is_some() {
                    debug!(job_id, "Job removed from polling set");
                    self.publish_active();
                }
                None
            }
            PollCommand::ActiveJobs { reply } => {
                let _ = reply.send(self.entries.keys().cloned().collect());
                None
            }
        }
    }

    async fn tick(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        // Attempts count scheduling decisions, so bump before polling and
        // time out the jobs whose budget is spent.
        let mut timed_out = Vec::new();
        let mut to_poll = Vec::new();
        for (job_id, entry) in self.entries.iter_mut() {
            entry.attempts += 1;
            if entry.attempts > entry.max_attempts {
                timed_out.push((
                    job_id.clone(),
                    entry.export_id.clone(),
                    entry.user_id.clone(),
                    entry.max_attempts,
                ));
            } else {
                to_poll.push((job_id.clone(), entry.export_id.clone()));
            }
        }

        for (job_id, export_id, user_id, max_attempts) in timed_out {
            self.entries.remove(&job_id);
            warn!(job_id, export_id, user_id, max_attempts, "Polling attempts exhausted");
            self.completion
                .fail_job(
                    &job_id,
                    "PollingTimeout",
                    &format!("Polling timeout after {max_attempts} attempts"),
                )
                .await;
            // The provider job is orphaned at this point; release it if we
            // can.
            if let Err(error) = self.provider.cancel_export(&export_id).await {
                debug!(export_id, %error, "Export cancel after timeout failed");
            }
        }

        let provider = self.provider.clone();
        let polls = to_poll.into_iter().map(|(job_id, export_id)| {
            let provider = provider.clone();
            async move {
                let result = provider.get_export_status(&export_id).await;
                (job_id, export_id, result)
            }
        });

        for (job_id, export_id, result) in join_all(polls).await {
            let verdict = self.apply_poll(&job_id, &export_id, result).await;
            if matches!(verdict, PollVerdict::Done) {
                self.entries.remove(&job_id);
            }
        }
        self.publish_active();
    }

    async fn apply_poll(
        &self,
        job_id: &str,
        export_id: &str,
        result: crate::provider::Result<crate::provider::ExportStatusResponse>,
    ) -> PollVerdict {
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                // Transient: stay enrolled, the attempt already counted.
                warn!(job_id, export_id, %error, "Poll failed, keeping job enrolled");
                return PollVerdict::Keep;
            }
        };

        match response.status {
            ProviderStatus::Ready => {
                info!(
                    job_id,
                    export_id,
                    artifacts = response.download_urls.len(),
                    "Export ready"
                );
                if let Err(error) = self
                    .repo
                    .update_status(job_id, JobStatus::Downloading, StatusPatch::default())
                    .await
                {
                    error!(job_id, %error, "Failed to move polled job to downloading");
                    return PollVerdict::Done;
                }
                if let Err(error) = self
                    .dispatcher
                    .dispatch(job_id, export_id, &response.download_urls)
                    .await
                {
                    error!(job_id, %error, "Dispatch of polled job failed");
                }
                PollVerdict::Done
            }
            ProviderStatus::Failed => {
                let cause = response
                    .error_message
                    .unwrap_or_else(|| "export failed at the provider".to_string());
                self.completion.fail_job(job_id, "ExportFailed", &cause).await;
                PollVerdict::Done
            }
            ProviderStatus::Expired => {
                let cause = response
                    .error_message
                    .unwrap_or_else(|| format!("export {export_id} expired"));
                self.completion
                    .fail_job(job_id, "ExportExpired", &cause)
                    .await;
                PollVerdict::Done
            }
            ProviderStatus::Pending | ProviderStatus::Processing | ProviderStatus::Unknown => {
                debug!(job_id, export_id, status = ?response.status, "Export not ready yet");
                PollVerdict::Keep
            }
        }
    }

    fn publish_active(&self) {
        self.active.store(self.entries.len(), Ordering::SeqCst);
    }
}
