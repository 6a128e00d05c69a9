//! Configuration Error Types
//!
//! Error handling for configuration loading and validation, with messages
//! that name the offending field.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A source file exists but could not be parsed or merged
    #[error("Failed to load configuration from {path:?}: {error}")]
    LoadFailed { path: Option<PathBuf>, error: String },

    /// Merged configuration does not fit the expected shape
    #[error("Failed to deserialize configuration: {0}")]
    Deserialize(String),

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;

impl ConfigurationError {
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        context: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        Self::LoadFailed {
            path: None,
            error: error.to_string(),
        }
    }
}
