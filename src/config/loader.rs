//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles file discovery,
//! environment detection and layering through the `config` crate.

use super::error::{ConfigResult, ConfigurationError};
use super::SyncConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_STEM: &str = "erp-sync";
const ENV_PREFIX: &str = "ERP_SYNC";

pub struct ConfigManager {
    config: SyncConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading synchronization configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            max_concurrent_tasks = config.executor.max_concurrent_tasks,
            chunk_size = config.batch.chunk_size,
            max_attempts = config.retry.max_attempts,
            database_configured = config.database.url.is_some(),
            "⚙️ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already built configuration (tests, embedded use)
    pub fn from_config(config: SyncConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect the current environment from environment variables
    pub fn detect_environment() -> String {
        Self::environment_from(|key| env::var(key).ok())
    }

    fn environment_from(lookup: impl Fn(&str) -> Option<String>) -> String {
        lookup("ERP_SYNC_ENV")
            .or_else(|| lookup("APP_ENV"))
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("ERP_SYNC_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(config_directory: &Path, environment: &str) -> ConfigResult<SyncConfig> {
        let base = config_directory.join(format!("{BASE_FILE_STEM}.toml"));
        let overlay = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        debug!(
            base = %base.display(),
            base_exists = base.exists(),
            overlay = %overlay.display(),
            overlay_exists = overlay.exists(),
            "Resolving configuration sources"
        );

        let merged = Config::builder()
            .add_source(File::from(base.as_path()).format(FileFormat::Toml).required(false))
            .add_source(
                File::from(overlay.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|error| ConfigurationError::LoadFailed {
                path: Some(config_directory.to_path_buf()),
                error: error.to_string(),
            })?;

        merged
            .try_deserialize::<SyncConfig>()
            .map_err(|error| ConfigurationError::Deserialize(error.to_string()))
    }
}
