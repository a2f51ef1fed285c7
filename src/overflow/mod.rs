//! Overflow task consumer
//!
//! Tasks the dispatcher could not place in the pool synchronously land on
//! the overflow queue; this consumer feeds them back in under
//! back-pressure: it only fetches when the pool can actually accept work.
//!
//! Acknowledgement policy: ack on success and on permanent failure (or
//! after the redelivery budget), leave retryable failures for the queue's
//! visibility window to redeliver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatch::CompletionAggregator;
use crate::ledger::JobRepository;
use crate::messages::DownloadTaskMessage;
use crate::pool::{PoolError, WorkerPool};
use crate::queue::{MessageQueue, QueueMessage};

pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct OverflowConfig {
    pub queue: String,
    pub batch_size: usize,
    pub receive_wait: Duration,
    /// Pause between pool capacity probes when the pool is full.
    pub backoff: Duration,
    pub max_redeliveries: u32,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            queue: "download-tasks-overflow".to_string(),
            batch_size: 10,
            receive_wait: Duration::from_secs(2),
            backoff: Duration::from_secs(1),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }
}

pub struct OverflowConsumer {
    queue: Arc<dyn MessageQueue>,
    pool: Arc<WorkerPool>,
    repo: Arc<dyn JobRepository>,
    completion: Arc<CompletionAggregator>,
    config: OverflowConfig,
}

impl OverflowConsumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        pool: Arc<WorkerPool>,
        repo: Arc<dyn JobRepository>,
        completion: Arc<CompletionAggregator>,
        config: OverflowConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            repo,
            completion,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.config.queue, "Overflow consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.pool.try_accept() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.backoff) => continue,
                }
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.queue.receive_messages(
                    &self.config.queue,
                    self.config.batch_size,
                    self.config.receive_wait,
                ) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(error) => {
                    error!(%error, "Failed to receive overflow tasks");
                    tokio::time::sleep(self.config.backoff).await;
                    continue;
                }
            };

            for message in messages {
                if *shutdown.borrow() {
                    return;
                }
                self.process(message, &mut shutdown).await;
            }
        }
        debug!("Overflow consumer stopped");
    }

    async fn process(&self, message: QueueMessage, shutdown: &mut watch::Receiver<bool>) {
        let task = match DownloadTaskMessage::parse(&message.body) {
            Ok(parsed) => parsed.into_task(),
            Err(error) => {
                error!(
                    message_id = %message.message_id,
                    %error,
                    "Invalid overflow task dropped"
                );
                self.ack(&message).await;
                return;
            }
        };

        // Late or duplicate deliveries for closed jobs must not move the
        // counters; drop them here.
        match self.repo.find_by_id(&task.job_id).await {
            Ok(Some(job)) if job.is_terminal() => {
                warn!(
                    job_id = %task.job_id,
                    task_id = %task.task_id,
                    "Overflow task for terminal job dropped"
                );
                self.ack(&message).await;
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(
                    job_id = %task.job_id,
                    task_id = %task.task_id,
                    "Overflow task for unknown job dropped"
                );
                self.ack(&message).await;
                return;
            }
            Err(error) => {
                error!(job_id = %task.job_id, %error, "Job lookup failed, will retry");
                return;
            }
        }

        let job_id = task.job_id.clone();
        let task_id = task.task_id.clone();
        let handle = match self.pool.submit(task).await {
            Ok(handle) => handle,
            // Capacity evaporated since try_accept; the message redelivers
            // after its visibility window.
            Err(PoolError::Saturated) => {
                debug!(task_id, "Pool filled up, leaving task for redelivery");
                return;
            }
            Err(PoolError::ShuttingDown) => return,
        };

        let outcome = tokio::select! {
            _ = shutdown.changed() => {
                debug!(task_id, "Shutdown while waiting on in-flight task");
                return;
            }
            outcome = handle.outcome() => outcome,
        };

        match outcome {
            Ok(receipt) => {
                self.completion
                    .record_success(&job_id, &task_id, &receipt)
                    .await;
                self.ack(&message).await;
            }
            Err(error) => {
                let retryable = error.is_retryable();
                if retryable && message.receive_count < self.config.max_redeliveries {
                    warn!(
                        job_id,
                        task_id,
                        receive_count = message.receive_count,
                        %error,
                        "Task failed, leaving for redelivery"
                    );
                } else {
                    let reason = if retryable {
                        format!("{error} (after {} deliveries)", message.receive_count)
                    } else {
                        error.to_string()
                    };
                    self.completion
                        .record_failure(&job_id, &task_id, &reason)
                        .await;
                    self.ack(&message).await;
                }
            }
        }
    }

    async fn ack(&self, message: &QueueMessage) {
        if let Err(error) = self
            .queue
            .delete_message(&self.config.queue, &message.receipt_handle)
            .await
        {
            error!(
                message_id = %message.message_id,
                %error,
                "Failed to acknowledge overflow task"
            );
        }
    }
}
