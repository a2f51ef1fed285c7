use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

/// Process-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            ledger_path: default_ledger_path(),
            queue_path: default_queue_path(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/ledger")
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queues")
}

/// Storage provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    S3,
    #[default]
    Memory,
}

/// Object store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// S3 access key (loaded from environment, not from config file)
    #[serde(skip)]
    pub access_key: Option<String>,
    /// S3 secret key (loaded from environment, not from config file)
    #[serde(skip)]
    pub secret_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            bucket: default_bucket(),
            endpoint: None,
            region: None,
            access_key: None,
            secret_key: None,
        }
    }
}

fn default_bucket() -> String {
    "exportbox-artifacts".to_string()
}

/// Export provider API endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_url")]
    pub base_url: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub status_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            status_timeout_secs: default_provider_timeout_secs(),
        }
    }
}

fn default_provider_url() -> String {
    "http://localhost:9100".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    30
}

/// Workflow engine callbacks and heartbeat cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_url")]
    pub base_url: String,
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
    /// The engine's heartbeat timeout should be at least twice this.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            base_url: default_workflow_url(),
            callback_timeout_secs: default_callback_timeout_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

fn default_workflow_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_callback_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

/// Logical queue names and delivery behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueuesConfig {
    #[serde(default = "default_jobs_queue")]
    pub export_jobs: String,
    #[serde(default = "default_overflow_queue")]
    pub overflow: String,
    #[serde(default = "default_receive_wait_secs")]
    pub receive_wait_secs: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Queue-level dead-letter threshold.
    #[serde(default = "default_max_receives")]
    pub max_receives: u32,
    /// Redelivery budget the overflow consumer honors per task.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            export_jobs: default_jobs_queue(),
            overflow: default_overflow_queue(),
            receive_wait_secs: default_receive_wait_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receives: default_max_receives(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

fn default_jobs_queue() -> String {
    "export-jobs".to_string()
}

fn default_overflow_queue() -> String {
    "download-tasks-overflow".to_string()
}

fn default_receive_wait_secs() -> u64 {
    2
}

fn default_visibility_timeout_secs() -> u64 {
    60
}

fn default_max_receives() -> u32 {
    5
}

fn default_max_redeliveries() -> u32 {
    3
}

/// Worker pool sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Executors plus backlog slots.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_pool_size() -> usize {
    8
}

fn default_max_concurrent_tasks() -> usize {
    32
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

/// Task fan-out behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchSettings {
    #[serde(default = "default_dispatch_batch_size")]
    pub batch_size: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_dispatch_batch_size(),
        }
    }
}

fn default_dispatch_batch_size() -> usize {
    25
}

/// Export status polling cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingSettings {
    #[serde(default = "default_polling_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_polling_interval_ms(),
        }
    }
}

fn default_polling_interval_ms() -> u64 {
    5_000
}

/// Streaming transfer limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferSettings {
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: ByteSize,
    #[serde(default = "default_part_size")]
    pub part_size: ByteSize,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_artifact_bytes: default_max_artifact_bytes(),
            part_size: default_part_size(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

fn default_max_artifact_bytes() -> ByteSize {
    ByteSize(5 * 1024 * 1024 * 1024)
}

fn default_part_size() -> ByteSize {
    ByteSize(8 * 1024 * 1024)
}

fn default_download_timeout_secs() -> u64 {
    300
}
