//! Service runtime: wiring and lifecycle
//!
//! Builds every component from configuration, spawns the long-running
//! loops (intake consumer, polling scheduler, overflow consumer, heartbeat)
//! and the operator HTTP listener, then waits for a shutdown signal. On
//! shutdown the consumers stop first, the pool drains under its grace
//! period, and the embedded stores are flushed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{self, state::AppState};
use crate::config::Config;
use crate::dispatch::{CompletionAggregator, TaskDispatcher};
use crate::events::TracingEventSink;
use crate::heartbeat::HeartbeatLoop;
use crate::intake::{IntakeConsumer, IntakeHandler};
use crate::ledger::FjallJobStore;
use crate::observability::Metrics;
use crate::overflow::OverflowConsumer;
use crate::pipeline::TransferPipeline;
use crate::polling::PollingService;
use crate::pool::WorkerPool;
use crate::provider::HttpExportProvider;
use crate::queue::FjallMessageQueue;
use crate::storage::StorageClient;
use crate::workflow::HttpWorkflowEngine;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(address: Option<SocketAddr>) -> Result<(), AnyError> {
    info!("Loading configuration");
    let config = Config::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let bind_addr = address.unwrap_or(config.server.bind_addr);

    // Embedded stores.
    let repo = Arc::new(
        FjallJobStore::open(&config.server.ledger_path)
            .map_err(|e| format!("Failed to open job ledger: {e}"))?,
    );
    let queue = Arc::new(
        FjallMessageQueue::open(&config.server.queue_path, config.queue_settings())
            .map_err(|e| format!("Failed to open queue store: {e}"))?,
    );

    // External collaborators.
    let storage = Arc::new(
        StorageClient::from_config(&config.storage)
            .map_err(|e| format!("Failed to build storage client: {e}"))?,
    );
    let provider = Arc::new(HttpExportProvider::new(
        &config.provider.base_url,
        Duration::from_secs(config.provider.status_timeout_secs),
    )?);
    let workflow = Arc::new(HttpWorkflowEngine::new(
        &config.workflow.base_url,
        Duration::from_secs(config.workflow.callback_timeout_secs),
    )?);
    let events = Arc::new(TracingEventSink::new());
    let metrics = Arc::new(Metrics::new());

    // Core engine.
    let pipeline = Arc::new(TransferPipeline::new(
        storage.clone(),
        config.transfer_limits(),
    )?);
    let pool = WorkerPool::new(config.pool_config(), pipeline);
    let completion = Arc::new(CompletionAggregator::new(
        repo.clone(),
        workflow.clone(),
        events.clone(),
        metrics.clone(),
    ));
    let dispatcher = Arc::new(TaskDispatcher::new(
        repo.clone(),
        pool.clone(),
        queue.clone(),
        completion.clone(),
        metrics.clone(),
        config.dispatch_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let polling = PollingService::start(
        config.polling_config(),
        repo.clone(),
        provider.clone(),
        dispatcher.clone(),
        completion.clone(),
        shutdown_rx.clone(),
    );

    let intake = Arc::new(IntakeHandler::new(
        repo.clone(),
        provider.clone(),
        dispatcher.clone(),
        polling.clone(),
        completion.clone(),
        events.clone(),
        metrics.clone(),
    ));
    let intake_consumer = Arc::new(IntakeConsumer::new(
        queue.clone(),
        intake,
        config.intake_consumer_config(),
    ));
    let overflow_consumer = Arc::new(OverflowConsumer::new(
        queue.clone(),
        pool.clone(),
        repo.clone(),
        completion.clone(),
        config.overflow_config(),
    ));
    let heartbeat = Arc::new(HeartbeatLoop::new(
        repo.clone(),
        workflow,
        dispatcher.clone(),
        metrics.clone(),
        config.heartbeat_config(),
    ));

    let mut loops = Vec::new();
    {
        let consumer = intake_consumer.clone();
        let shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { consumer.run(shutdown).await }));
    }
    {
        let consumer = overflow_consumer.clone();
        let shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { consumer.run(shutdown).await }));
    }
    {
        let heartbeat = heartbeat.clone();
        let shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { heartbeat.run(shutdown).await }));
    }

    // Operator read surface.
    let state = AppState::new(repo.clone(), queue.clone(), pool.clone(), metrics);
    let app = api::router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "Operator API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop consumers and schedulers, then drain the pool.
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(error) = handle.await {
            warn!(%error, "Background loop did not stop cleanly");
        }
    }
    pool.shutdown(Duration::from_millis(config.pool.shutdown_grace_ms))
        .await;

    if let Err(error) = queue.flush() {
        warn!(%error, "Queue flush on shutdown failed");
    }
    if let Err(error) = repo.persist() {
        warn!(%error, "Ledger flush on shutdown failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
