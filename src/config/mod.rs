//! # Synchronization Engine Configuration
//!
//! Typed configuration for the executor, retry policy, timeouts, change
//! detector, batch synchronizer and scheduler.
//!
//! ## Architecture
//!
//! - **Layered sources**: `config/erp-sync.toml`, then `config/erp-sync.<env>.toml`,
//!   then `ERP_SYNC__<SECTION>__<KEY>` environment variables
//! - **Complete defaults**: every section is `#[serde(default)]`, so an empty
//!   file yields the documented production defaults
//! - **Explicit validation**: [`SyncConfig::validate`] rejects inconsistent
//!   values instead of silently clamping them
//!
//! ## Usage
//!
//! ```rust,no_run
//! use erp_sync_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let chunk_size = manager.config().batch.chunk_size;
//! let budget = manager.config().timeouts.bulk_pull_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::defaults;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/erp-sync.toml`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub change_detection: ChangeDetectionConfig,
    pub batch: BatchConfig,
    pub health: HealthConfig,
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
}

/// What to do when a dispatch collides with an in-flight task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Return the in-flight task id
    #[default]
    Attach,
    /// Refuse with `DUPLICATE_IN_FLIGHT`
    Reject,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_concurrent_tasks: usize,
    pub duplicate_policy: DuplicatePolicy,
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: defaults::MAX_CONCURRENT_TASKS,
            duplicate_policy: DuplicatePolicy::Attach,
            queue_capacity: defaults::QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before attempt 2, 3, ...; the last entry repeats
    pub backoff_seconds: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            backoff_seconds: defaults::BACKOFF_SECONDS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub detection_seconds: u64,
    pub single_entity_seconds: u64,
    pub bulk_push_seconds: u64,
    pub bulk_pull_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            detection_seconds: defaults::DETECTION_TIMEOUT_SECONDS,
            single_entity_seconds: defaults::SINGLE_ENTITY_TIMEOUT_SECONDS,
            bulk_push_seconds: defaults::BULK_PUSH_TIMEOUT_SECONDS,
            bulk_pull_seconds: defaults::BULK_PULL_TIMEOUT_SECONDS,
        }
    }
}

impl TimeoutConfig {
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_secs(self.detection_seconds)
    }

    pub fn single_entity_timeout(&self) -> Duration {
        Duration::from_secs(self.single_entity_seconds)
    }

    pub fn bulk_push_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_push_seconds)
    }

    pub fn bulk_pull_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_pull_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChangeDetectionConfig {
    pub interval_seconds: u64,
    /// Minimum upstream modification count that triggers a pull
    pub threshold: u64,
    /// Lookback window for connections that never synced
    pub fallback_lookback_hours: i64,
    /// Added to the observed count to form the incremental fetch limit
    pub limit_buffer: u64,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            interval_seconds: defaults::DETECTION_INTERVAL_SECONDS,
            threshold: defaults::CHANGE_THRESHOLD,
            fallback_lookback_hours: defaults::FALLBACK_LOOKBACK_HOURS,
            limit_buffer: defaults::LIMIT_BUFFER,
        }
    }
}

impl ChangeDetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn fallback_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.fallback_lookback_hours)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub inter_item_delay_ms: u64,
    pub memory_soft_limit_mb: u64,
    pub memory_hard_limit_mb: u64,
    pub max_reported_errors: usize,
    pub upstream_page_size: usize,
    pub default_pull_limit: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::CHUNK_SIZE,
            inter_item_delay_ms: defaults::INTER_ITEM_DELAY_MS,
            memory_soft_limit_mb: defaults::MEMORY_SOFT_LIMIT_MB,
            memory_hard_limit_mb: defaults::MEMORY_HARD_LIMIT_MB,
            max_reported_errors: defaults::MAX_REPORTED_ERRORS,
            upstream_page_size: defaults::UPSTREAM_PAGE_SIZE,
            default_pull_limit: defaults::DEFAULT_PULL_LIMIT,
        }
    }
}

impl BatchConfig {
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub degraded_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_latency_ms: defaults::DEGRADED_LATENCY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: defaults::SCHEDULER_TICK_SECONDS,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `None` selects the in-memory store
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl SyncConfig {
    /// Reject values that would make the engine misbehave
    pub fn validate(&self) -> ConfigResult<()> {
        if self.executor.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::invalid_value(
                "executor.max_concurrent_tasks",
                0,
                "at least one worker is required",
            ));
        }
        if self.executor.queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "executor.queue_capacity",
                0,
                "queues must hold at least one task",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                0,
                "must allow at least one attempt",
            ));
        }
        if self.retry.max_attempts > 1 && self.retry.backoff_seconds.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "retry.backoff_seconds",
                "[]",
                "retries need at least one backoff delay",
            ));
        }
        for (field, value) in [
            ("timeouts.detection_seconds", self.timeouts.detection_seconds),
            ("timeouts.single_entity_seconds", self.timeouts.single_entity_seconds),
            ("timeouts.bulk_push_seconds", self.timeouts.bulk_push_seconds),
            ("timeouts.bulk_pull_seconds", self.timeouts.bulk_pull_seconds),
        ] {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "timeouts must be positive",
                ));
            }
        }
        if self.batch.chunk_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.chunk_size",
                0,
                "chunks must contain at least one item",
            ));
        }
        if self.batch.upstream_page_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.upstream_page_size",
                0,
                "pages must contain at least one record",
            ));
        }
        if self.batch.memory_soft_limit_mb >= self.batch.memory_hard_limit_mb {
            return Err(ConfigurationError::invalid_value(
                "batch.memory_soft_limit_mb",
                self.batch.memory_soft_limit_mb,
                format!(
                    "soft limit must be below hard limit ({}MB)",
                    self.batch.memory_hard_limit_mb
                ),
            ));
        }
        if self.change_detection.fallback_lookback_hours <= 0 {
            return Err(ConfigurationError::invalid_value(
                "change_detection.fallback_lookback_hours",
                self.change_detection.fallback_lookback_hours,
                "lookback window must be positive",
            ));
        }
        if self.scheduler.tick_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.tick_seconds",
                0,
                "scheduler tick must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.backoff_seconds, vec![60, 180, 600]);
        assert_eq!(config.timeouts.bulk_pull_timeout(), Duration::from_secs(3600));
        assert_eq!(config.batch.chunk_size, 100);
        assert_eq!(config.change_detection.threshold, 1);
    }

    #[test]
    fn test_soft_limit_must_be_below_hard_limit() {
        let mut config = SyncConfig::default();
        config.batch.memory_soft_limit_mb = 2048;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch.memory_soft_limit_mb"));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let mut config = SyncConfig::default();
        config.batch.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retries_need_backoff() {
        let mut config = SyncConfig::default();
        config.retry.backoff_seconds.clear();
        assert!(config.validate().is_err());
        config.retry.max_attempts = 1;
        assert!(config.validate().is_ok());
    }
}
