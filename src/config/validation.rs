use thiserror::Error;

use super::models::Config;
use crate::pipeline::MAX_ARTIFACT_BYTES;

// S3 multipart parts below 5 MiB are rejected by the store.
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("pool_size must be positive")]
    EmptyPool,

    #[error("max_concurrent_tasks ({max_concurrent}) must be >= pool_size ({pool_size})")]
    ConcurrencyBelowPool {
        max_concurrent: usize,
        pool_size: usize,
    },

    #[error("transfer.part_size must be at least {MIN_PART_SIZE} bytes, got {0}")]
    PartSizeTooSmall(u64),

    #[error("transfer.max_artifact_bytes cannot exceed the {MAX_ARTIFACT_BYTES} byte ceiling, got {0}")]
    ArtifactLimitTooLarge(u64),

    #[error("{0} must be positive")]
    ZeroDuration(&'static str),

    #[error("dispatch.batch_size must be positive")]
    EmptyBatch,

    #[error("queues.max_redeliveries must be positive")]
    ZeroRedeliveries,
}

pub fn validate(config: &Config) -> Result<(), ValidationError> {
    if config.pool.pool_size == 0 {
        return Err(ValidationError::EmptyPool);
    }
    if config.pool.max_concurrent_tasks < config.pool.pool_size {
        return Err(ValidationError::ConcurrencyBelowPool {
            max_concurrent: config.pool.max_concurrent_tasks,
            pool_size: config.pool.pool_size,
        });
    }
    if config.transfer.part_size.as_u64() < MIN_PART_SIZE {
        return Err(ValidationError::PartSizeTooSmall(
            config.transfer.part_size.as_u64(),
        ));
    }
    if config.transfer.max_artifact_bytes.as_u64() > MAX_ARTIFACT_BYTES {
        return Err(ValidationError::ArtifactLimitTooLarge(
            config.transfer.max_artifact_bytes.as_u64(),
        ));
    }
    if config.polling.interval_ms == 0 {
        return Err(ValidationError::ZeroDuration("polling.interval_ms"));
    }
    if config.workflow.heartbeat_interval_ms == 0 {
        return Err(ValidationError::ZeroDuration("workflow.heartbeat_interval_ms"));
    }
    if config.transfer.download_timeout_secs == 0 {
        return Err(ValidationError::ZeroDuration("transfer.download_timeout_secs"));
    }
    if config.dispatch.batch_size == 0 {
        return Err(ValidationError::EmptyBatch);
    }
    if config.queues.max_redeliveries == 0 {
        return Err(ValidationError::ZeroRedeliveries);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::ByteSize;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate(&Config::default()), Ok(()));
    }

    #[test]
    fn rejects_zero_pool() {
        let mut config = Config::default();
        config.pool.pool_size = 0;
        assert_eq!(validate(&config), Err(ValidationError::EmptyPool));
    }

    #[test]
    fn rejects_backlog_smaller_than_pool() {
        let mut config = Config::default();
        config.pool.pool_size = 8;
        config.pool.max_concurrent_tasks = 4;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ConcurrencyBelowPool { .. })
        ));
    }

    #[test]
    fn rejects_tiny_parts_and_oversized_artifact_cap() {
        let mut config = Config::default();
        config.transfer.part_size = ByteSize(1024);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::PartSizeTooSmall(_))
        ));

        let mut config = Config::default();
        config.transfer.max_artifact_bytes = ByteSize(6 * 1024 * 1024 * 1024);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ArtifactLimitTooLarge(_))
        ));
    }

    #[test]
    fn rejects_zero_cadences() {
        let mut config = Config::default();
        config.polling.interval_ms = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroDuration(_))
        ));
    }
}
