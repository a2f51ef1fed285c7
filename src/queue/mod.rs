//! Message queue contract and the embedded fjall-backed implementation
//!
//! Two logical queues flow through here: `export-jobs` (intake) and
//! `download-tasks-overflow` (tasks the worker pool could not accept
//! synchronously). Delivery is at-least-once: a received message stays
//! invisible for the visibility window and reappears unless deleted.

pub mod store;

use async_trait::async_trait;
use std::time::Duration;

pub use store::{FjallMessageQueue, QueueError, QueueSettings};

pub type Result<T> = std::result::Result<T, QueueError>;

/// One received message. `receive_count` starts at 1 on first delivery.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub receipt_handle: String,
    pub receive_count: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message, returning its id.
    async fn send_message(&self, queue: &str, body: &str) -> Result<String>;

    /// Receive up to `max` visible messages, long-polling up to `wait`.
    async fn receive_messages(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Acknowledge: remove the message for good.
    async fn delete_message(&self, queue: &str, receipt_handle: &str) -> Result<()>;

    /// Extend or shorten the invisibility window of an in-flight message.
    async fn change_message_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        visibility: Duration,
    ) -> Result<()>;
}
