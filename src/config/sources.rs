use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "EXPORTBOX_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/exportbox.toml";
const ENV_PREFIX: &str = "EXPORTBOX";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config);
    Ok(config)
}

/// Load secrets from environment variables into config.
/// Secrets are never stored in TOML files, only in environment.
fn load_secrets(config: &mut Config) {
    if let Ok(access_key) = env::var("S3_ACCESS_KEY") {
        config.storage.access_key = Some(access_key);
    }
    if let Ok(secret_key) = env::var("S3_SECRET_KEY") {
        config.storage.secret_key = Some(secret_key);
    }

    // Alternative: AWS-style environment variable names
    if config.storage.access_key.is_none() {
        if let Ok(access_key) = env::var("AWS_ACCESS_KEY_ID") {
            config.storage.access_key = Some(access_key);
        }
    }
    if config.storage.secret_key.is_none() {
        if let Ok(secret_key) = env::var("AWS_SECRET_ACCESS_KEY") {
            config.storage.secret_key = Some(secret_key);
        }
    }
}

/// Load configuration from a specific path and environment.
/// Useful for testing with custom config files.
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // EXPORTBOX__POOL__POOL_SIZE -> pool.pool_size
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
