//! In-process event publishing
//!
//! Job and task lifecycle events are fire-and-forget: a failed publish is
//! logged and never blocks the flow that produced it. Tests swap in the
//! capturing sink to assert on emitted events.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

pub type Result<T> = std::result::Result<T, EventError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    JobCreated {
        job_id: String,
        export_id: String,
        user_id: String,
    },
    JobCompleted {
        job_id: String,
        completed_tasks: u32,
        failed_tasks: u32,
    },
    JobFailed {
        job_id: String,
        error_message: String,
    },
    TaskCompleted {
        job_id: String,
        task_id: String,
    },
    TaskFailed {
        job_id: String,
        task_id: String,
        error_message: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::JobCreated { .. } => "JobCreated",
            Event::JobCompleted { .. } => "JobCompleted",
            Event::JobFailed { .. } => "JobFailed",
            Event::TaskCompleted { .. } => "TaskCompleted",
            Event::TaskFailed { .. } => "TaskFailed",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Event::JobCreated { job_id, .. }
            | Event::JobCompleted { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::TaskCompleted { job_id, .. }
            | Event::TaskFailed { job_id, .. } => job_id,
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Default sink: structured log lines only.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl TracingEventSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: Event) -> Result<()> {
        info!(event = event.name(), job_id = event.job_id(), "Event published");
        Ok(())
    }
}

/// Test sink that records every event in order.
#[derive(Debug, Default)]
pub struct CapturingEventSink {
    events: Mutex<Vec<Event>>,
}

impl CapturingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event log lock poisoned").clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }
}

#[async_trait]
impl EventSink for CapturingEventSink {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events
            .lock()
            .expect("event log lock poisoned")
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capturing_sink_records_in_order() {
        let sink = CapturingEventSink::new();
        sink.publish(Event::JobCreated {
            job_id: "j".into(),
            export_id: "e".into(),
            user_id: "u".into(),
        })
        .await
        .unwrap();
        sink.publish(Event::TaskCompleted {
            job_id: "j".into(),
            task_id: "t".into(),
        })
        .await
        .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "JobCreated");
        assert_eq!(sink.count("TaskCompleted"), 1);
    }
}
