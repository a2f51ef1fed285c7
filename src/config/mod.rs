//! Configuration management
//!
//! Layered loading: struct defaults, then a TOML file, then environment
//! variables. The file path comes from `EXPORTBOX_CONFIG` (default
//! `config/exportbox.toml`); overrides use the `EXPORTBOX__<section>__<key>`
//! pattern, e.g. `EXPORTBOX__POOL__POOL_SIZE=16`. S3 credentials are read
//! only from the environment, never from the file.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    Config, DispatchSettings, PollingSettings, PoolSettings, ProviderConfig, QueuesConfig,
    ServerConfig, StorageConfig, StorageProvider, TransferSettings, WorkflowConfig,
};
pub use validation::ValidationError;

use std::time::Duration;
use thiserror::Error;

use crate::dispatch::DispatchConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::intake::IntakeConsumerConfig;
use crate::overflow::OverflowConfig;
use crate::pipeline::TransferLimits;
use crate::polling::PollingConfig;
use crate::pool::PoolConfig;
use crate::queue::store::QueueSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path (testing).
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout: Duration::from_secs(self.queues.visibility_timeout_secs),
            max_receives: self.queues.max_receives,
            ..QueueSettings::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool.pool_size,
            max_concurrent_tasks: self.pool.max_concurrent_tasks,
        }
    }

    pub fn transfer_limits(&self) -> TransferLimits {
        TransferLimits {
            max_artifact_bytes: self.transfer.max_artifact_bytes.as_u64(),
            part_size: self.transfer.part_size.as_usize(),
            download_timeout: Duration::from_secs(self.transfer.download_timeout_secs),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            batch_size: self.dispatch.batch_size,
            overflow_queue: self.queues.overflow.clone(),
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig {
            interval: Duration::from_millis(self.polling.interval_ms),
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.workflow.heartbeat_interval_ms),
            ..HeartbeatConfig::default()
        }
    }

    pub fn intake_consumer_config(&self) -> IntakeConsumerConfig {
        IntakeConsumerConfig {
            queue: self.queues.export_jobs.clone(),
            receive_wait: Duration::from_secs(self.queues.receive_wait_secs),
            ..IntakeConsumerConfig::default()
        }
    }

    pub fn overflow_config(&self) -> OverflowConfig {
        OverflowConfig {
            queue: self.queues.overflow.clone(),
            receive_wait: Duration::from_secs(self.queues.receive_wait_secs),
            max_redeliveries: self.queues.max_redeliveries,
            ..OverflowConfig::default()
        }
    }
}
