use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::job::ExportTask;

use super::executor::{spawn_executor, ExecEvent, ExecutorSeat};
use super::{PoolError, PoolStats, TaskError, TaskHandle, TaskOutcome, TaskRunner};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of executors.
    pub pool_size: usize,
    /// Pool-wide concurrency ceiling; backlog capacity is
    /// `max_concurrent_tasks - pool_size`.
    pub max_concurrent_tasks: usize,
}

impl PoolConfig {
    fn backlog_capacity(&self) -> usize {
        self.max_concurrent_tasks.saturating_sub(self.pool_size)
    }
}

enum PoolCommand {
    Submit {
        task: ExportTask,
        reply: oneshot::Sender<Result<oneshot::Receiver<TaskOutcome>, PoolError>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Shared, lock-free view of pool occupancy for the non-suspending
/// `try_accept` path. The coordinator is the only writer.
#[derive(Debug, Default)]
struct Occupancy {
    idle: AtomicUsize,
    queued: AtomicUsize,
    live: AtomicUsize,
    accepting: AtomicBool,
}

/// Bounded executor pool with a FIFO backlog.
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    occupancy: Arc<Occupancy>,
    pool_size: usize,
    backlog_capacity: usize,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        let occupancy = Arc::new(Occupancy::default());
        occupancy.accepting.store(true, Ordering::SeqCst);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let backlog_capacity = config.backlog_capacity();

        info!(
            pool_size = config.pool_size,
            backlog_capacity, "Starting worker pool"
        );

        let coordinator = Coordinator::new(
            config.pool_size,
            backlog_capacity,
            runner,
            commands_rx,
            occupancy.clone(),
        );
        tokio::spawn(coordinator.run());

        Arc::new(Self {
            commands: commands_tx,
            occupancy,
            pool_size: config.pool_size,
            backlog_capacity,
        })
    }

    /// True when an executor is idle or the backlog has room. Never
    /// suspends; the answer can go stale under concurrent submitters, in
    /// which case `submit` still returns `Saturated` authoritatively.
    pub fn try_accept(&self) -> bool {
        self.occupancy.accepting.load(Ordering::SeqCst)
            && (self.occupancy.idle.load(Ordering::SeqCst) > 0
                || self.occupancy.queued.load(Ordering::SeqCst) < self.backlog_capacity)
    }

    pub fn idle_count(&self) -> usize {
        self.occupancy.idle.load(Ordering::SeqCst)
    }

    pub fn queue_length(&self) -> usize {
        self.occupancy.queued.load(Ordering::SeqCst)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Pool health: at least half the executors alive.
    pub fn is_healthy(&self) -> bool {
        self.occupancy.live.load(Ordering::SeqCst) >= self.pool_size.div_ceil(2)
    }

    /// Hand a task to an idle executor or queue it. Returns `Saturated`
    /// when the backlog is full; the caller overflows the task to the
    /// external queue.
    pub async fn submit(&self, task: ExportTask) -> Result<TaskHandle, PoolError> {
        let task_id = task.task_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Submit {
                task,
                reply: reply_tx,
            })
            .map_err(|_| PoolError::ShuttingDown)?;
        let receiver = reply_rx.await.map_err(|_| PoolError::ShuttingDown)??;
        Ok(TaskHandle::new(task_id, receiver))
    }

    pub async fn stats(&self) -> PoolStats {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::Stats { reply: reply_tx })
            .is_err()
        {
            return self.offline_stats();
        }
        reply_rx.await.unwrap_or_else(|_| self.offline_stats())
    }

    fn offline_stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.pool_size,
            active: 0,
            idle: 0,
            queue_length: 0,
            live_executors: 0,
            completed: 0,
            failed: 0,
            average_duration_ms: 0,
            healthy: false,
        }
    }

    /// Stop accepting, fail queued tasks, drain executors, and terminate
    /// stragglers after the grace period.
    pub async fn shutdown(&self, grace: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::Shutdown {
                grace,
                done: done_tx,
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

struct InFlight {
    outcome: oneshot::Sender<TaskOutcome>,
}

struct QueuedTask {
    task: ExportTask,
    outcome: oneshot::Sender<TaskOutcome>,
}

struct ShutdownState {
    /// Cleared once stragglers have been terminated.
    deadline: Option<Instant>,
    done: oneshot::Sender<()>,
}

struct Coordinator {
    pool_size: usize,
    backlog_capacity: usize,
    runner: Arc<dyn TaskRunner>,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    events_tx: mpsc::UnboundedSender<ExecEvent>,
    events_rx: mpsc::UnboundedReceiver<ExecEvent>,
    executors: HashMap<u64, ExecutorSeat>,
    idle_ids: VecDeque<u64>,
    backlog: VecDeque<QueuedTask>,
    inflight: HashMap<u64, InFlight>,
    occupancy: Arc<Occupancy>,
    completed: u64,
    failed: u64,
    completed_duration_ms: u64,
    next_executor_id: u64,
    shutdown: Option<ShutdownState>,
}

impl Coordinator {
    fn new(
        pool_size: usize,
        backlog_capacity: usize,
        runner: Arc<dyn TaskRunner>,
        commands: mpsc::UnboundedReceiver<PoolCommand>,
        occupancy: Arc<Occupancy>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut coordinator = Self {
            pool_size,
            backlog_capacity,
            runner,
            commands,
            events_tx,
            events_rx,
            executors: HashMap::new(),
            idle_ids: VecDeque::new(),
            backlog: VecDeque::new(),
            inflight: HashMap::new(),
            occupancy,
            completed: 0,
            failed: 0,
            completed_duration_ms: 0,
            next_executor_id: 0,
            shutdown: None,
        };
        for _ in 0..pool_size {
            coordinator.spawn_seat();
        }
        coordinator.publish_occupancy();
        coordinator
    }

    async fn run(mut self) {
        loop {
            let deadline = self.shutdown.as_ref().and_then(|s| s.deadline);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // Pool handle dropped without an explicit shutdown;
                        // release executors and stop.
                        self.release_all();
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = async { tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)) },
                    if deadline.is_some() =>
                {
                    self.terminate_stragglers();
                }
            }

            if self.shutdown.is_some() && self.executors.is_empty() {
                if let Some(state) = self.shutdown.take() {
                    let _ = state.done.send(());
                }
                info!("Worker pool shut down");
                break;
            }
        }
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit { task, reply } => {
                let result = self.handle_submit(task);
                let _ = reply.send(result);
            }
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::Shutdown { grace, done } => self.begin_shutdown(grace, done),
        }
    }

    fn handle_submit(
        &mut self,
        task: ExportTask,
    ) -> Result<oneshot::Receiver<TaskOutcome>, PoolError> {
        if self.shutdown.is_some() {
            return Err(PoolError::ShuttingDown);
        }
        let (outcome_tx, outcome_rx) = oneshot::channel();
        if let Some(id) = self.idle_ids.pop_front() {
            self.dispatch(id, task, outcome_tx);
        } else if self.backlog.len() < self.backlog_capacity {
            self.backlog.push_back(QueuedTask {
                task,
                outcome: outcome_tx,
            });
        } else {
            return Err(PoolError::Saturated);
        }
        self.publish_occupancy();
        Ok(outcome_rx)
    }

    fn dispatch(&mut self, id: u64, task: ExportTask, outcome: oneshot::Sender<TaskOutcome>) {
        let Some(seat) = self.executors.get(&id) else {
            // Seat vanished between idle bookkeeping and dispatch; its exit
            // event will respawn it. Requeue at the front to keep order.
            self.backlog.push_front(QueuedTask { task, outcome });
            return;
        };
        let Some(sender) = seat.tasks.as_ref() else {
            self.backlog.push_front(QueuedTask { task, outcome });
            return;
        };
        match sender.try_send(task) {
            Ok(()) => {
                self.inflight.insert(id, InFlight { outcome });
            }
            Err(error) => {
                warn!(executor_id = id, %error, "Executor refused task, requeueing");
                self.backlog.push_front(QueuedTask {
                    task: error.into_inner(),
                    outcome,
                });
            }
        }
    }

    fn handle_event(&mut self, event: ExecEvent) {
        match event {
            ExecEvent::Completed {
                executor_id,
                outcome,
                duration,
            } => {
                if let Some(inflight) = self.inflight.remove(&executor_id) {
                    match &outcome {
                        Ok(_) => {
                            self.completed += 1;
                            self.completed_duration_ms += duration.as_millis() as u64;
                        }
                        Err(_) => self.failed += 1,
                    }
                    let _ = inflight.outcome.send(outcome);
                }
                if self.shutdown.is_some() {
                    // Drained seat exits once its (already released) sender
                    // side is gone.
                    if let Some(seat) = self.executors.get_mut(&executor_id) {
                        seat.release();
                    }
                } else if let Some(queued) = self.backlog.pop_front() {
                    self.dispatch(executor_id, queued.task, queued.outcome);
                } else {
                    self.idle_ids.push_back(executor_id);
                }
                self.publish_occupancy();
            }
            ExecEvent::Exited {
                executor_id,
                panicked,
            } => {
                self.executors.remove(&executor_id);
                self.idle_ids.retain(|id| *id != executor_id);
                if let Some(inflight) = self.inflight.remove(&executor_id) {
                    self.failed += 1;
                    let _ = inflight.outcome.send(Err(TaskError::ExecutorCrashed));
                }
                if self.shutdown.is_none() {
                    if panicked {
                        warn!(executor_id, "Executor crashed, spawning replacement");
                    } else {
                        debug!(executor_id, "Executor exited, spawning replacement");
                    }
                    // spawn_seat parks the replacement in the idle set.
                    let replacement = self.spawn_seat();
                    if let Some(queued) = self.backlog.pop_front() {
                        self.idle_ids.retain(|id| *id != replacement);
                        self.dispatch(replacement, queued.task, queued.outcome);
                    }
                }
                self.publish_occupancy();
            }
        }
    }

    fn spawn_seat(&mut self) -> u64 {
        let id = self.next_executor_id;
        self.next_executor_id += 1;
        let seat = spawn_executor(id, self.runner.clone(), self.events_tx.clone());
        self.executors.insert(id, seat);
        self.idle_ids.push_back(id);
        id
    }

    fn begin_shutdown(&mut self, grace: Duration, done: oneshot::Sender<()>) {
        info!(
            backlog = self.backlog.len(),
            active = self.inflight.len(),
            "Worker pool shutting down"
        );
        self.occupancy.accepting.store(false, Ordering::SeqCst);
        for queued in self.backlog.drain(..) {
            let _ = queued.outcome.send(Err(TaskError::PoolShutdown));
        }
        for seat in self.executors.values_mut() {
            seat.release();
        }
        self.idle_ids.clear();
        self.shutdown = Some(ShutdownState {
            deadline: Some(Instant::now() + grace),
            done,
        });
        self.publish_occupancy();
    }

    fn terminate_stragglers(&mut self) {
        for seat in self.executors.values() {
            warn!(executor_id = seat.id, "Grace period elapsed, terminating executor");
            seat.abort.abort();
        }
        if let Some(state) = self.shutdown.as_mut() {
            state.deadline = None;
        }
    }

    fn release_all(&mut self) {
        for seat in self.executors.values_mut() {
            seat.release();
        }
    }

    fn snapshot(&self) -> PoolStats {
        let average_duration_ms = if self.completed > 0 {
            self.completed_duration_ms / self.completed
        } else {
            0
        };
        PoolStats {
            pool_size: self.pool_size,
            active: self.inflight.len(),
            idle: self.idle_ids.len(),
            queue_length: self.backlog.len(),
            live_executors: self.executors.len(),
            completed: self.completed,
            failed: self.failed,
            average_duration_ms,
            healthy: self.executors.len() >= self.pool_size.div_ceil(2),
        }
    }

    fn publish_occupancy(&self) {
        self.occupancy
            .idle
            .store(self.idle_ids.len(), Ordering::SeqCst);
        self.occupancy
            .queued
            .store(self.backlog.len(), Ordering::SeqCst);
        self.occupancy
            .live
            .store(self.executors.len(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{TransferError, TransferReceipt};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Runner scripted through the task's file name:
    /// - `panic`: dies (executor crash path)
    /// - `fail`: returns a non-retryable transfer failure
    /// - `slow`: sleeps 200ms first
    /// - anything else: succeeds after 10ms
    struct ScriptedRunner {
        started: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: Mutex::new(Vec::new()),
            })
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(&self, task: &ExportTask) -> Result<TransferReceipt, TransferError> {
            self.started.lock().unwrap().push(task.file_name.clone());
            match task.file_name.as_str() {
                "panic" => panic!("executor down"),
                "fail" => Err(TransferError::DownloadFailed {
                    message: "HTTP 404".into(),
                    status: Some(404),
                    retryable: false,
                }),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(receipt(task))
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(receipt(task))
                }
            }
        }
    }

    fn receipt(task: &ExportTask) -> TransferReceipt {
        TransferReceipt {
            uploaded_key: task.output_key.clone(),
            bytes: 1,
            duration_ms: 1,
        }
    }

    fn task(name: &str) -> ExportTask {
        ExportTask::new("job-1", 0, "https://cdn/x", name, None, None)
    }

    #[tokio::test]
    async fn submit_runs_and_reports_outcome() {
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 2,
                max_concurrent_tasks: 4,
            },
            ScriptedRunner::new(),
        );
        let handle = pool.submit(task("ok.bin")).await.unwrap();
        let outcome = handle.outcome().await.unwrap();
        assert_eq!(outcome.uploaded_key, "job-1/0_ok.bin");
    }

    #[tokio::test]
    async fn task_failures_propagate_as_outcomes() {
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                max_concurrent_tasks: 2,
            },
            ScriptedRunner::new(),
        );
        let handle = pool.submit(task("fail")).await.unwrap();
        let outcome = handle.outcome().await;
        assert!(matches!(outcome, Err(TaskError::Transfer(_))));

        let stats = pool.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn backlog_preserves_fifo_order() {
        let runner = ScriptedRunner::new();
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                max_concurrent_tasks: 4,
            },
            runner.clone(),
        );

        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            handles.push(pool.submit(task(name)).await.unwrap());
        }
        for handle in handles {
            handle.outcome().await.unwrap();
        }
        assert_eq!(runner.started(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn saturation_rejects_and_try_accept_tracks_it() {
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                max_concurrent_tasks: 2,
            },
            ScriptedRunner::new(),
        );

        assert!(pool.try_accept());
        let first = pool.submit(task("slow")).await.unwrap();
        let second = pool.submit(task("slow")).await.unwrap();

        // One running, one queued: the pool is full.
        assert!(!pool.try_accept());
        let rejected = pool.submit(task("c")).await;
        assert!(matches!(rejected, Err(PoolError::Saturated)));

        first.outcome().await.unwrap();
        second.outcome().await.unwrap();
        assert!(pool.try_accept());
    }

    #[tokio::test]
    async fn crashed_executor_fails_task_and_is_replaced() {
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 2,
                max_concurrent_tasks: 4,
            },
            ScriptedRunner::new(),
        );

        let handle = pool.submit(task("panic")).await.unwrap();
        let outcome = handle.outcome().await;
        assert!(matches!(outcome, Err(TaskError::ExecutorCrashed)));

        // Replacement restores the pool; later work still runs.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.live_executors, 2);
        assert!(stats.healthy);

        let handle = pool.submit(task("after-crash")).await.unwrap();
        handle.outcome().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_fails_backlog_and_rejects_new_work() {
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                max_concurrent_tasks: 3,
            },
            ScriptedRunner::new(),
        );
        let running = pool.submit(task("slow")).await.unwrap();
        let queued = pool.submit(task("queued")).await.unwrap();

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown(Duration::from_secs(1)).await })
        };

        let queued_outcome = queued.outcome().await;
        assert!(matches!(queued_outcome, Err(TaskError::PoolShutdown)));

        // The running task finishes within the grace period.
        let running_outcome = running.outcome().await;
        assert!(running_outcome.is_ok());

        shutdown.await.unwrap();
        assert!(matches!(
            pool.submit(task("late")).await,
            Err(PoolError::ShuttingDown)
        ));
        assert!(!pool.try_accept());
    }

    #[tokio::test]
    async fn stats_track_completions_and_averages() {
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 2,
                max_concurrent_tasks: 4,
            },
            ScriptedRunner::new(),
        );
        for name in ["a", "b", "c"] {
            pool.submit(task(name)).await.unwrap().outcome().await.unwrap();
        }
        let stats = pool.stats().await;
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pool_size, 2);
        assert_eq!(stats.live_executors, 2);
        assert!(stats.healthy);
        assert!(stats.average_duration_ms >= 1);
    }
}
