//! Workflow heartbeats and completion reconciliation for active jobs
//!
//! While a job is downloading, the parent workflow only knows the service
//! is alive through periodic heartbeats on the callback token. The same
//! scan doubles as the repair pass for jobs whose counters are fully
//! accounted but whose terminal write was lost (for example a transient
//! store fault during completion): those are pushed back through the
//! dispatcher's completion check instead of being kept alive forever.
//! Heartbeat failures are logged and never touch job state; a token the
//! engine no longer recognizes just means the completion path will settle
//! the job on its own. The engine's heartbeat timeout must be at least
//! twice the interval so one missed tick cannot end the task.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatch::TaskDispatcher;
use crate::job::JobStatus;
use crate::ledger::JobRepository;
use crate::observability::Metrics;
use crate::workflow::{WorkflowEngine, WorkflowError};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Upper bound on jobs scanned per tick.
    pub scan_limit: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            scan_limit: 500,
        }
    }
}

pub struct HeartbeatLoop {
    repo: Arc<dyn JobRepository>,
    workflow: Arc<dyn WorkflowEngine>,
    dispatcher: Arc<TaskDispatcher>,
    metrics: Arc<Metrics>,
    config: HeartbeatConfig,
}

impl HeartbeatLoop {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        workflow: Arc<dyn WorkflowEngine>,
        dispatcher: Arc<TaskDispatcher>,
        metrics: Arc<Metrics>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            repo,
            workflow,
            dispatcher,
            metrics,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.beat().await,
            }
        }
        debug!("Heartbeat loop stopped");
    }

    /// One tick: repair fully-accounted jobs stranded in `DOWNLOADING`,
    /// then send one heartbeat per remaining job that carries a callback
    /// token.
    pub async fn beat(&self) {
        let jobs = match self
            .repo
            .find_by_status(JobStatus::Downloading, self.config.scan_limit)
            .await
        {
            Ok(jobs) => jobs,
            Err(error) => {
                error!(%error, "Heartbeat scan failed");
                return;
            }
        };

        let mut active = Vec::new();
        for job in jobs {
            if job.total_tasks > 0
                && job.completed_tasks + job.failed_tasks >= job.total_tasks
            {
                // Every task reported but the terminal write never landed;
                // finish the job instead of heartbeating it forever.
                info!(
                    job_id = %job.job_id,
                    completed = job.completed_tasks,
                    failed = job.failed_tasks,
                    "Repairing fully-accounted job left in DOWNLOADING"
                );
                self.metrics.job_reconciled();
                if let Err(error) = self.dispatcher.check_job_completion(&job.job_id).await {
                    warn!(
                        job_id = %job.job_id,
                        %error,
                        "Completion repair failed, will retry next tick"
                    );
                }
                continue;
            }
            active.push(job);
        }

        let workflow = self.workflow.clone();
        let beats = active.into_iter().filter_map(|job| {
            let token = job.callback_token.clone()?;
            let workflow = workflow.clone();
            Some(async move {
                let result = workflow.send_task_heartbeat(&token).await;
                (job.job_id, result)
            })
        });

        for (job_id, result) in join_all(beats).await {
            match result {
                Ok(()) => {
                    self.metrics.heartbeat_sent();
                    debug!(job_id, "Heartbeat sent");
                }
                Err(WorkflowError::TaskGone) => {
                    // Stale token: the workflow moved on. The job's own
                    // completion path will notice its terminal state.
                    warn!(job_id, "Heartbeat token no longer known to the workflow");
                }
                Err(error) => warn!(job_id, %error, "Heartbeat failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CompletionAggregator, DispatchConfig};
    use crate::events::CapturingEventSink;
    use crate::job::{ExportJob, ExportTask, NewJob};
    use crate::ledger::{MemoryJobStore, StatusPatch};
    use crate::pipeline::{TransferError, TransferReceipt};
    use crate::pool::{PoolConfig, TaskRunner, WorkerPool};
    use crate::queue::{store::QueueSettings, FjallMessageQueue};
    use crate::workflow::RecordingWorkflow;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// The reconciliation path never runs new transfers; this runner only
    /// satisfies the pool's constructor.
    struct NoopRunner;

    #[async_trait]
    impl TaskRunner for NoopRunner {
        async fn run(&self, task: &ExportTask) -> Result<TransferReceipt, TransferError> {
            Ok(TransferReceipt {
                uploaded_key: task.output_key.clone(),
                bytes: 0,
                duration_ms: 0,
            })
        }
    }

    struct Fixture {
        repo: Arc<MemoryJobStore>,
        workflow: Arc<RecordingWorkflow>,
        metrics: Arc<Metrics>,
        heartbeat: HeartbeatLoop,
        _tmp: TempDir,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let repo = Arc::new(MemoryJobStore::new());
        let workflow = Arc::new(RecordingWorkflow::new());
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(
            FjallMessageQueue::open(tmp.path().join("queues"), QueueSettings::default()).unwrap(),
        );
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                max_concurrent_tasks: 2,
            },
            Arc::new(NoopRunner),
        );
        let completion = Arc::new(CompletionAggregator::new(
            repo.clone(),
            workflow.clone(),
            Arc::new(CapturingEventSink::new()),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            repo.clone(),
            pool,
            queue,
            completion,
            metrics.clone(),
            DispatchConfig::default(),
        ));
        let heartbeat = HeartbeatLoop::new(
            repo.clone(),
            workflow.clone(),
            dispatcher,
            metrics.clone(),
            HeartbeatConfig::default(),
        );

        Fixture {
            repo,
            workflow,
            metrics,
            heartbeat,
            _tmp: tmp,
        }
    }

    async fn downloading_job(repo: &MemoryJobStore, job_id: &str, token: Option<&str>) {
        let job = ExportJob::create(NewJob {
            job_id: job_id.into(),
            export_id: "e".into(),
            user_id: "u".into(),
            callback_token: token.map(str::to_string),
            ..Default::default()
        })
        .unwrap();
        repo.save(&job).await.unwrap();
        repo.update_status(job_id, JobStatus::Processing, StatusPatch::default())
            .await
            .unwrap();
        repo.update_status(job_id, JobStatus::Downloading, StatusPatch::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn beats_only_for_downloading_jobs_with_tokens() {
        let f = fixture().await;

        downloading_job(&f.repo, "with-token", Some("tok-1")).await;
        downloading_job(&f.repo, "no-token", None).await;

        // Pending job: not scanned.
        let pending = ExportJob::create(NewJob {
            job_id: "pending".into(),
            export_id: "e".into(),
            user_id: "u".into(),
            callback_token: Some("tok-2".into()),
            ..Default::default()
        })
        .unwrap();
        f.repo.save(&pending).await.unwrap();

        f.heartbeat.beat().await;

        assert_eq!(f.workflow.heartbeat_count(), 1);
    }

    #[tokio::test]
    async fn repeated_beats_keep_sending() {
        let f = fixture().await;
        downloading_job(&f.repo, "j1", Some("tok")).await;

        f.heartbeat.beat().await;
        f.heartbeat.beat().await;

        assert_eq!(f.workflow.heartbeat_count(), 2);
    }

    #[tokio::test]
    async fn fully_accounted_job_is_repaired_not_heartbeat() {
        let f = fixture().await;
        downloading_job(&f.repo, "j1", Some("tok")).await;
        f.repo
            .record_tasks(
                "j1",
                vec![ExportTask::new("j1", 0, "https://cdn/x", "f0", None, None)],
            )
            .await
            .unwrap();
        // The outcome landed but the terminal write was lost.
        f.repo.increment_completed_tasks("j1").await.unwrap();

        f.heartbeat.beat().await;

        let job = f.repo.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(f.workflow.successes().len(), 1);
        assert_eq!(f.workflow.heartbeat_count(), 0);
        assert_eq!(f.metrics.snapshot().jobs_reconciled, 1);

        // Next tick: the job is terminal, nothing more to do.
        f.heartbeat.beat().await;
        assert_eq!(f.workflow.successes().len(), 1);
        assert_eq!(f.workflow.heartbeat_count(), 0);
    }
}
