use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{MessageQueue, QueueMessage, Result};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),
}

/// Behavior knobs shared by all logical queues in this store.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a received message stays invisible before redelivery.
    pub visibility_timeout: Duration,
    /// Deliveries after which a message is dead-lettered instead of served.
    pub max_receives: u32,
    /// Poll cadence used to satisfy long-poll receives.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            max_receives: 5,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
    visible_at_ms: u64,
    enqueued_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetteredMessage {
    pub message_id: String,
    pub body: String,
    pub receive_count: u32,
    pub reason: String,
    pub dead_lettered_at_ms: u64,
}

/// Embedded message queue on a fjall keyspace.
///
/// Layout per logical queue `q`:
/// - partition `q`: seq (u64 big-endian) -> StoredMessage (JSON)
/// - partition `q.dlq`: seq -> DeadLetteredMessage (JSON)
/// - partition `metadata`: "next_seq:q" -> u64
///
/// Sequential keys keep FIFO scans cheap; the receipt handle is the
/// sequence number, so redelivered messages keep a stable receipt.
pub struct FjallMessageQueue {
    keyspace: Keyspace,
    metadata: PartitionHandle,
    partitions: Mutex<HashMap<String, PartitionHandle>>,
    settings: QueueSettings,
    // Serializes scan-and-update cycles in receive/delete/visibility paths.
    writer: Mutex<()>,
}

impl FjallMessageQueue {
    pub fn open<P: AsRef<Path>>(path: P, settings: QueueSettings) -> Result<Self> {
        info!(path = %path.as_ref().display(), "Opening message queue store");
        let keyspace = Config::new(path).open()?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            metadata,
            partitions: Mutex::new(HashMap::new()),
            settings,
            writer: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(b"next_seq:__health__")?;
        Ok(())
    }

    fn partition(&self, name: &str) -> Result<PartitionHandle> {
        let mut partitions = self.partitions.lock().expect("partition cache poisoned");
        if let Some(handle) = partitions.get(name) {
            return Ok(handle.clone());
        }
        let handle = self
            .keyspace
            .open_partition(name, PartitionCreateOptions::default())?;
        partitions.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    fn next_seq(&self, queue: &str) -> Result<u64> {
        let key = format!("next_seq:{queue}").into_bytes();
        let current = self
            .metadata
            .get(&key)?
            .map(|bytes| u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0);
        self.metadata.insert(key, (current + 1).to_be_bytes())?;
        Ok(current)
    }

    /// Visible backlog depth (in-flight messages not counted).
    pub fn visible_len(&self, queue: &str) -> Result<usize> {
        let partition = self.partition(queue)?;
        let now = now_ms();
        let mut count = 0;
        for item in partition.iter() {
            let (_, value) = item?;
            let message: StoredMessage = serde_json::from_slice(&value)?;
            if message.visible_at_ms <= now {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Dead-lettered messages, oldest first (inspection/debugging).
    pub fn list_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetteredMessage>> {
        let dlq = self.partition(&format!("{queue}.dlq"))?;
        let mut results = Vec::new();
        for item in dlq.iter().take(limit) {
            let (_, value) = item?;
            results.push(serde_json::from_slice(&value)?);
        }
        Ok(results)
    }

    fn receive_batch(&self, queue: &str, max: usize) -> Result<Vec<QueueMessage>> {
        let _guard = self.writer.lock().expect("queue writer lock poisoned");
        let partition = self.partition(queue)?;
        let dlq = self.partition(&format!("{queue}.dlq"))?;
        let now = now_ms();

        let mut received = Vec::new();
        for item in partition.iter() {
            if received.len() >= max {
                break;
            }
            let (key, value) = item?;
            let mut message: StoredMessage = serde_json::from_slice(&value)?;
            if message.visible_at_ms > now {
                continue;
            }

            if message.receive_count >= self.settings.max_receives {
                let entry = DeadLetteredMessage {
                    message_id: message.message_id.clone(),
                    body: message.body.clone(),
                    receive_count: message.receive_count,
                    reason: format!("exceeded {} receives", self.settings.max_receives),
                    dead_lettered_at_ms: now,
                };
                dlq.insert(key.as_ref(), serde_json::to_vec(&entry)?)?;
                partition.remove(key.as_ref())?;
                warn!(
                    queue,
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "Message dead-lettered"
                );
                continue;
            }

            message.receive_count += 1;
            message.visible_at_ms = now + self.settings.visibility_timeout.as_millis() as u64;
            partition.insert(key.as_ref(), serde_json::to_vec(&message)?)?;

            let seq = u64::from_be_bytes(key.as_ref().try_into().unwrap_or([0u8; 8]));
            received.push(QueueMessage {
                message_id: message.message_id,
                body: message.body,
                receipt_handle: seq.to_string(),
                receive_count: message.receive_count,
            });
        }
        Ok(received)
    }

    fn parse_receipt(receipt_handle: &str) -> Result<[u8; 8]> {
        let seq: u64 = receipt_handle
            .parse()
            .map_err(|_| QueueError::InvalidReceipt(receipt_handle.to_string()))?;
        Ok(seq.to_be_bytes())
    }
}

#[async_trait]
impl MessageQueue for FjallMessageQueue {
    async fn send_message(&self, queue: &str, body: &str) -> Result<String> {
        let _guard = self.writer.lock().expect("queue writer lock poisoned");
        let partition = self.partition(queue)?;
        let seq = self.next_seq(queue)?;

        let message = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            receive_count: 0,
            visible_at_ms: 0,
            enqueued_at_ms: now_ms(),
        };
        partition.insert(seq.to_be_bytes(), serde_json::to_vec(&message)?)?;
        debug!(queue, seq, message_id = %message.message_id, "Message enqueued");
        Ok(message.message_id)
    }

    async fn receive_messages(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = self.receive_batch(queue, max)?;
            if !batch.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn delete_message(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        let _guard = self.writer.lock().expect("queue writer lock poisoned");
        let partition = self.partition(queue)?;
        let key = Self::parse_receipt(receipt_handle)?;
        partition.remove(key)?;
        debug!(queue, receipt_handle, "Message deleted");
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        visibility: Duration,
    ) -> Result<()> {
        let _guard = self.writer.lock().expect("queue writer lock poisoned");
        let partition = self.partition(queue)?;
        let key = Self::parse_receipt(receipt_handle)?;
        let value = partition
            .get(key)?
            .ok_or_else(|| QueueError::MessageNotFound(receipt_handle.to_string()))?;
        let mut message: StoredMessage = serde_json::from_slice(&value)?;
        message.visible_at_ms = now_ms() + visibility.as_millis() as u64;
        partition.insert(key, serde_json::to_vec(&message)?)?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_queue(settings: QueueSettings) -> (FjallMessageQueue, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallMessageQueue::open(temp_dir.path().join("queue"), settings).unwrap();
        (queue, temp_dir)
    }

    #[tokio::test]
    async fn send_receive_delete() {
        let (queue, _tmp) = open_queue(QueueSettings::default());
        queue.send_message("export-jobs", "{\"a\":1}").await.unwrap();

        let messages = queue
            .receive_messages("export-jobs", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "{\"a\":1}");
        assert_eq!(messages[0].receive_count, 1);

        queue
            .delete_message("export-jobs", &messages[0].receipt_handle)
            .await
            .unwrap();
        let again = queue
            .receive_messages("export-jobs", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn received_messages_stay_invisible_until_timeout() {
        let settings = QueueSettings {
            visibility_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (queue, _tmp) = open_queue(settings);
        queue.send_message("q", "m").await.unwrap();

        let first = queue.receive_messages("q", 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        // In-flight: nothing visible.
        let hidden = queue.receive_messages("q", 10, Duration::ZERO).await.unwrap();
        assert!(hidden.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let redelivered = queue.receive_messages("q", 10, Duration::ZERO).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test]
    async fn fifo_order_within_a_queue() {
        let (queue, _tmp) = open_queue(QueueSettings::default());
        for i in 0..3 {
            queue.send_message("q", &format!("m{i}")).await.unwrap();
        }
        let messages = queue.receive_messages("q", 10, Duration::ZERO).await.unwrap();
        let bodies: Vec<_> = messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn poison_messages_are_dead_lettered() {
        let settings = QueueSettings {
            visibility_timeout: Duration::from_millis(1),
            max_receives: 2,
            ..Default::default()
        };
        let (queue, _tmp) = open_queue(settings);
        queue.send_message("q", "poison").await.unwrap();

        for _ in 0..2 {
            let batch = queue.receive_messages("q", 10, Duration::ZERO).await.unwrap();
            assert_eq!(batch.len(), 1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Third receive hits the cap: dead-lettered, not delivered.
        let batch = queue.receive_messages("q", 10, Duration::ZERO).await.unwrap();
        assert!(batch.is_empty());
        let dead = queue.list_dead_letters("q", 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "poison");
    }

    #[tokio::test]
    async fn visibility_can_be_extended() {
        let settings = QueueSettings {
            visibility_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (queue, _tmp) = open_queue(settings);
        queue.send_message("q", "m").await.unwrap();

        let batch = queue.receive_messages("q", 1, Duration::ZERO).await.unwrap();
        queue
            .change_message_visibility("q", &batch[0].receipt_handle, Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let hidden = queue.receive_messages("q", 10, Duration::ZERO).await.unwrap();
        assert!(hidden.is_empty());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let (queue, _tmp) = open_queue(QueueSettings::default());
        queue.send_message("a", "for-a").await.unwrap();
        let from_b = queue.receive_messages("b", 10, Duration::ZERO).await.unwrap();
        assert!(from_b.is_empty());
        assert_eq!(queue.visible_len("a").unwrap(), 1);
    }

    #[tokio::test]
    async fn sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue");
        {
            let queue = FjallMessageQueue::open(&path, QueueSettings::default()).unwrap();
            queue.send_message("q", "m0").await.unwrap();
            queue.flush().unwrap();
        }
        let queue = FjallMessageQueue::open(&path, QueueSettings::default()).unwrap();
        queue.send_message("q", "m1").await.unwrap();
        let messages = queue.receive_messages("q", 10, Duration::ZERO).await.unwrap();
        assert_eq!(messages.len(), 2);
    }
}
