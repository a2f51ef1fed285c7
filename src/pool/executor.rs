use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::job::ExportTask;

use super::{TaskError, TaskOutcome, TaskRunner};

/// Messages executors send back to the coordinator.
#[derive(Debug)]
pub(crate) enum ExecEvent {
    Completed {
        executor_id: u64,
        outcome: TaskOutcome,
        duration: Duration,
    },
    Exited {
        executor_id: u64,
        panicked: bool,
    },
}

/// Coordinator-side handle to one executor.
pub(crate) struct ExecutorSeat {
    pub id: u64,
    /// Dropping the sender drains the executor: it exits after its current
    /// task, if any.
    pub tasks: Option<mpsc::Sender<ExportTask>>,
    pub abort: AbortHandle,
}

impl ExecutorSeat {
    pub fn release(&mut self) {
        self.tasks = None;
    }
}

/// Spawn one long-lived executor plus a watchdog that reports its exit.
///
/// The executor runs one task at a time. A panic inside the runner kills
/// the executor task; the watchdog observes the panicked join and tells the
/// coordinator, which fails the in-flight task and spawns a replacement.
pub(crate) fn spawn_executor(
    id: u64,
    runner: Arc<dyn TaskRunner>,
    events: mpsc::UnboundedSender<ExecEvent>,
) -> ExecutorSeat {
    let (tasks_tx, mut tasks_rx) = mpsc::channel::<ExportTask>(1);

    let loop_events = events.clone();
    let join = tokio::spawn(async move {
        while let Some(task) = tasks_rx.recv().await {
            let started = Instant::now();
            debug!(executor_id = id, task_id = %task.task_id, "Executor picked up task");
            let outcome = runner.run(&task).await.map_err(TaskError::from);
            let _ = loop_events.send(ExecEvent::Completed {
                executor_id: id,
                outcome,
                duration: started.elapsed(),
            });
        }
        debug!(executor_id = id, "Executor drained");
    });

    let abort = join.abort_handle();
    tokio::spawn(async move {
        let panicked = match join.await {
            Ok(()) => false,
            Err(e) => e.is_panic(),
        };
        let _ = events.send(ExecEvent::Exited {
            executor_id: id,
            panicked,
        });
    });

    ExecutorSeat {
        id,
        tasks: Some(tasks_tx),
        abort,
    }
}
