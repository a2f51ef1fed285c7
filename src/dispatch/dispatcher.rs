use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::job::ExportTask;
use crate::ledger::{JobRepository, LedgerError};
use crate::messages::DownloadTaskMessage;
use crate::observability::Metrics;
use crate::pool::{PoolError, TaskHandle, WorkerPool};
use crate::provider::DownloadUrlInfo;
use crate::queue::{MessageQueue, QueueError};

use super::completion::CompletionAggregator;

pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 25;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub overflow_queue: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            overflow_queue: "download-tasks-overflow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDestination {
    /// Accepted by the in-process worker pool.
    Internal,
    /// Serialized onto the overflow queue.
    Overflow,
}

/// Result of one fan-out. A "failed" entry means the dispatch itself failed
/// (the task could not be handed anywhere), not that the task's transfer
/// failed.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub total: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub destinations: Vec<(String, TaskDestination)>,
}

impl DispatchReport {
    pub fn internal(&self) -> usize {
        self.destinations
            .iter()
            .filter(|(_, d)| *d == TaskDestination::Internal)
            .count()
    }

    pub fn overflow(&self) -> usize {
        self.destinations
            .iter()
            .filter(|(_, d)| *d == TaskDestination::Overflow)
            .count()
    }
}

/// Splits a ready export into per-artifact tasks and fans them out between
/// the worker pool and the overflow queue.
pub struct TaskDispatcher {
    repo: Arc<dyn JobRepository>,
    pool: Arc<WorkerPool>,
    queue: Arc<dyn MessageQueue>,
    completion: Arc<CompletionAggregator>,
    metrics: Arc<Metrics>,
    config: DispatchConfig,
}

impl TaskDispatcher {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        pool: Arc<WorkerPool>,
        queue: Arc<dyn MessageQueue>,
        completion: Arc<CompletionAggregator>,
        metrics: Arc<Metrics>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            repo,
            pool,
            queue,
            completion,
            metrics,
            config,
        }
    }

    /// Split `urls` into tasks (created exactly once per job) and dispatch
    /// them. The completion denominator is persisted before any task can
    /// report an outcome.
    pub async fn dispatch(
        &self,
        job_id: &str,
        export_id: &str,
        urls: &[DownloadUrlInfo],
    ) -> Result<DispatchReport, DispatchError> {
        let tasks: Vec<ExportTask> = urls
            .iter()
            .enumerate()
            .map(|(index, info)| {
                ExportTask::new(
                    job_id,
                    index,
                    &info.url,
                    &info.file_name,
                    info.file_size,
                    info.checksum.clone(),
                )
            })
            .collect();

        let view = self.repo.record_tasks(job_id, tasks.clone()).await?;

        if tasks.is_empty() {
            // Empty export: nothing to download, the job is a zero-output
            // success right away.
            info!(job_id, "Export produced no artifacts, completing immediately");
            self.completion.finalize(&view).await;
            return Ok(DispatchReport::default());
        }

        let mut report = DispatchReport {
            total: tasks.len(),
            ..Default::default()
        };

        for batch in tasks.chunks(self.config.batch_size) {
            for task in batch {
                let destination = self.dispatch_one(task, export_id).await;
                match destination {
                    Some(destination) => {
                        report.dispatched += 1;
                        report.destinations.push((task.task_id.clone(), destination));
                    }
                    None => report.failed += 1,
                }
            }
        }

        info!(
            job_id,
            total = report.total,
            internal = report.internal(),
            overflow = report.overflow(),
            failed = report.failed,
            "Dispatch finished"
        );
        Ok(report)
    }

    /// Try the pool first; overflow when it cannot accept synchronously.
    async fn dispatch_one(&self, task: &ExportTask, export_id: &str) -> Option<TaskDestination> {
        if self.pool.try_accept() {
            match self.pool.submit(task.clone()).await {
                Ok(handle) => {
                    self.watch(task, handle);
                    return Some(TaskDestination::Internal);
                }
                // Lost the race for the last slot; fall through to overflow.
                Err(PoolError::Saturated | PoolError::ShuttingDown) => {
                    debug!(task_id = %task.task_id, "Pool refused task, overflowing")
                }
            }
        }

        let message = DownloadTaskMessage::from_task(task, export_id);
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(error) => {
                error!(task_id = %task.task_id, %error, "Failed to serialize overflow task");
                self.record_dispatch_failure(task, &error.to_string()).await;
                return None;
            }
        };

        match self
            .queue
            .send_message(&self.config.overflow_queue, &body)
            .await
        {
            Ok(_) => {
                self.metrics.task_overflowed();
                Some(TaskDestination::Overflow)
            }
            Err(error) => {
                error!(task_id = %task.task_id, %error, "Failed to publish overflow task");
                self.record_dispatch_failure(task, &error.to_string()).await;
                None
            }
        }
    }

    /// A task that could be handed nowhere will never produce an outcome;
    /// close its slot in the counters so the job can still terminate.
    async fn record_dispatch_failure(&self, task: &ExportTask, error: &str) {
        self.completion
            .record_failure(
                &task.job_id,
                &task.task_id,
                &format!("dispatch failed: {error}"),
            )
            .await;
    }

    fn watch(&self, task: &ExportTask, handle: TaskHandle) {
        let completion = self.completion.clone();
        let job_id = task.job_id.clone();
        let task_id = task.task_id.clone();
        tokio::spawn(async move {
            let outcome = handle.outcome().await;
            completion.record_outcome(&job_id, &task_id, &outcome).await;
        });
    }

    /// Idempotent completion probe: marks the job completed (and fires the
    /// callback) when every task is accounted for. A no-op on terminal
    /// jobs and on jobs that never got a task split.
    pub async fn check_job_completion(&self, job_id: &str) -> Result<(), DispatchError> {
        let Some(job) = self.repo.find_by_id(job_id).await? else {
            warn!(job_id, "Completion check for unknown job");
            return Ok(());
        };
        if job.is_terminal() {
            return Ok(());
        }
        if job.total_tasks > 0 && job.completed_tasks + job.failed_tasks >= job.total_tasks {
            self.completion.finalize(&job).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CapturingEventSink;
    use crate::job::{ExportJob, JobStatus, NewJob};
    use crate::ledger::{MemoryJobStore, StatusPatch};
    use crate::pipeline::{TransferError, TransferReceipt};
    use crate::pool::{PoolConfig, TaskRunner};
    use crate::queue::{store::QueueSettings, FjallMessageQueue, MessageQueue as _};
    use crate::workflow::RecordingWorkflow;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct InstantRunner;

    #[async_trait]
    impl TaskRunner for InstantRunner {
        async fn run(&self, task: &ExportTask) -> Result<TransferReceipt, TransferError> {
            Ok(TransferReceipt {
                uploaded_key: task.output_key.clone(),
                bytes: 1,
                duration_ms: 1,
            })
        }
    }

    struct Fixture {
        repo: Arc<MemoryJobStore>,
        workflow: Arc<RecordingWorkflow>,
        queue: Arc<FjallMessageQueue>,
        dispatcher: TaskDispatcher,
        _tmp: TempDir,
    }

    async fn fixture(pool_size: usize, max_concurrent: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let repo = Arc::new(MemoryJobStore::new());
        let workflow = Arc::new(RecordingWorkflow::new());
        let events = Arc::new(CapturingEventSink::new());
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(
            FjallMessageQueue::open(tmp.path().join("queue"), QueueSettings::default()).unwrap(),
        );
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size,
                max_concurrent_tasks: max_concurrent,
            },
            Arc::new(InstantRunner),
        );
        let completion = Arc::new(CompletionAggregator::new(
            repo.clone(),
            workflow.clone(),
            events,
            metrics.clone(),
        ));
        let dispatcher = TaskDispatcher::new(
            repo.clone(),
            pool,
            queue.clone(),
            completion,
            metrics,
            DispatchConfig::default(),
        );
        Fixture {
            repo,
            workflow,
            queue,
            dispatcher,
            _tmp: tmp,
        }
    }

    async fn downloading_job(repo: &MemoryJobStore, job_id: &str, token: Option<&str>) {
        let job = ExportJob::create(NewJob {
            job_id: job_id.into(),
            export_id: "e1".into(),
            user_id: "u1".into(),
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

    fn urls(n: usize) -> Vec<DownloadUrlInfo> {
        (0..n)
            .map(|i| DownloadUrlInfo {
                url: format!("https://cdn.example.com/{i}"),
                file_name: format!("f{i}.bin"),
                file_size: None,
                checksum: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn small_fanout_stays_internal_and_completes() {
        let f = fixture(2, 8).await;
        downloading_job(&f.repo, "j1", Some("tok")).await;

        let report = f.dispatcher.dispatch("j1", "e1", &urls(3)).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.internal(), 3);
        assert_eq!(report.overflow(), 0);

        // Pool waiters record outcomes; wait for completion.
        for _ in 0..50 {
            let job = f.repo.find_by_id("j1").await.unwrap().unwrap();
            if job.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let job = f.repo.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_tasks, 3);
        assert_eq!(f.workflow.successes().len(), 1);
    }

    #[tokio::test]
    async fn overflow_receives_what_the_pool_rejects() {
        // 1 executor + backlog of 1: anything past 2 overflows.
        let f = fixture(1, 2).await;
        downloading_job(&f.repo, "j1", None).await;

        let report = f.dispatcher.dispatch("j1", "e1", &urls(6)).await.unwrap();
        assert_eq!(report.total, 6);
        assert_eq!(report.failed, 0);
        assert!(report.overflow() >= 4);

        let overflowed = f
            .queue
            .receive_messages("download-tasks-overflow", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(overflowed.len(), report.overflow());
        let message = DownloadTaskMessage::parse(&overflowed[0].body).unwrap();
        assert_eq!(message.job_id, "j1");
        assert_eq!(message.export_id, "e1");
    }

    #[tokio::test]
    async fn zero_urls_is_an_immediate_empty_success() {
        let f = fixture(1, 2).await;
        downloading_job(&f.repo, "j1", Some("tok")).await;

        let report = f.dispatcher.dispatch("j1", "e1", &[]).await.unwrap();
        assert_eq!(report.total, 0);

        let job = f.repo.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_tasks, 0);

        let successes = f.workflow.successes();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].total_tasks, 0);
        assert!(successes[0].outputs.is_none());
    }

    #[tokio::test]
    async fn tasks_are_persisted_with_derived_keys() {
        let f = fixture(2, 8).await;
        downloading_job(&f.repo, "j1", None).await;
        f.dispatcher.dispatch("j1", "e1", &urls(2)).await.unwrap();

        let job = f.repo.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(job.total_tasks, 2);
        assert_eq!(job.tasks.len(), 2);
        assert_eq!(job.tasks[0].output_key, "j1/0_f0.bin");
        assert_eq!(job.tasks[1].output_key, "j1/1_f1.bin");
    }

    #[tokio::test]
    async fn completion_check_is_idempotent() {
        let f = fixture(2, 8).await;
        downloading_job(&f.repo, "j1", Some("tok")).await;
        f.dispatcher.dispatch("j1", "e1", &urls(1)).await.unwrap();

        for _ in 0..50 {
            if f.repo
                .find_by_id("j1")
                .await
                .unwrap()
                .unwrap()
                .is_terminal()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        f.dispatcher.check_job_completion("j1").await.unwrap();
        f.dispatcher.check_job_completion("j1").await.unwrap();
        assert_eq!(f.workflow.successes().len(), 1);
    }
}
