//! Observability stubs (metrics, tracing)

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics handle for recording counters/gauges
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_received: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_overflowed: AtomicU64,
    heartbeats_sent: AtomicU64,
    callbacks_sent: AtomicU64,
    jobs_reconciled: AtomicU64,
    ledger_write_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_received(&self) {
        self.jobs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_overflowed(&self) {
        self.tasks_overflowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_sent(&self) {
        self.callbacks_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A fully-accounted job was repaired back onto the completion path.
    pub fn job_reconciled(&self) {
        self.jobs_reconciled.fetch_add(1, Ordering::Relaxed);
    }

    /// A terminal status write was given up on after retries.
    pub fn ledger_write_failed(&self) {
        self.ledger_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_received: self.jobs_received.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_overflowed: self.tasks_overflowed.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            callbacks_sent: self.callbacks_sent.load(Ordering::Relaxed),
            jobs_reconciled: self.jobs_reconciled.load(Ordering::Relaxed),
            ledger_write_failures: self.ledger_write_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_received: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_overflowed: u64,
    pub heartbeats_sent: u64,
    pub callbacks_sent: u64,
    pub jobs_reconciled: u64,
    pub ledger_write_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.job_received();
        metrics.task_completed();
        metrics.task_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_received, 1);
        assert_eq!(snapshot.tasks_completed, 2);
        assert_eq!(snapshot.jobs_failed, 0);
        assert_eq!(snapshot.ledger_write_failures, 0);
    }
}
