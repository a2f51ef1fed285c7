use std::sync::Arc;

use crate::ledger::JobRepository;
use crate::observability::Metrics;
use crate::pool::WorkerPool;
use crate::queue::FjallMessageQueue;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn JobRepository>,
    pub queue: Arc<FjallMessageQueue>,
    pub pool: Arc<WorkerPool>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        queue: Arc<FjallMessageQueue>,
        pool: Arc<WorkerPool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repo,
            queue,
            pool,
            metrics,
        }
    }
}
