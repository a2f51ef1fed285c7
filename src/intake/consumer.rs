use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::messages::ExportJobMessage;
use crate::queue::{MessageQueue, QueueMessage};

use super::handler::IntakeHandler;

#[derive(Debug, Clone)]
pub struct IntakeConsumerConfig {
    pub queue: String,
    pub batch_size: usize,
    pub receive_wait: Duration,
    pub error_backoff: Duration,
}

impl Default for IntakeConsumerConfig {
    fn default() -> Self {
        Self {
            queue: "export-jobs".to_string(),
            batch_size: 10,
            receive_wait: Duration::from_secs(2),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Drains the export-jobs queue into the intake handler.
///
/// Acknowledgement policy: invalid payloads and duplicates are deleted so
/// they cannot loop; handler faults (provider or repository) leave the
/// message for redelivery under the queue's own retry and dead-letter
/// policy.
pub struct IntakeConsumer {
    queue: Arc<dyn MessageQueue>,
    handler: Arc<IntakeHandler>,
    config: IntakeConsumerConfig,
}

impl IntakeConsumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        handler: Arc<IntakeHandler>,
        config: IntakeConsumerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.queue.receive_messages(
                    &self.config.queue,
                    self.config.batch_size,
                    self.config.receive_wait,
                ) => received,
            };

            match received {
                Ok(messages) => {
                    for message in messages {
                        self.process(message).await;
                    }
                }
                Err(error) => {
                    error!(%error, "Failed to receive job messages");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }
        debug!("Intake consumer stopped");
    }

    async fn process(&self, message: QueueMessage) {
        let parsed = match ExportJobMessage::parse(&message.body) {
            Ok(parsed) => parsed,
            Err(error) => {
                error!(
                    message_id = %message.message_id,
                    %error,
                    "Invalid job message dropped"
                );
                self.ack(&message).await;
                return;
            }
        };

        match self.handler.handle(&parsed).await {
            Ok(outcome) => {
                debug!(
                    job_id = %parsed.job_id,
                    needs_polling = outcome.needs_polling,
                    can_start_downloading = outcome.can_start_downloading,
                    "Job message handled"
                );
                self.ack(&message).await;
            }
            Err(error) => {
                warn!(
                    job_id = %parsed.job_id,
                    receive_count = message.receive_count,
                    %error,
                    "Intake failed, leaving message for redelivery"
                );
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
                "Failed to acknowledge message"
            );
        }
    }
}
