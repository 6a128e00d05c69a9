//! # Error Handling
//!
//! Crate-wide error type and the error taxonomy exposed on tasks.
//!
//! Every failure surfaced to a caller or persisted on a task carries an
//! [`ErrorKind`]. The kind decides whether the retry policy is allowed to
//! schedule another attempt; the message is what operators see.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::adapter::AdapterError;
use crate::catalog::CatalogError;
use crate::config::ConfigurationError;
use crate::models::{ConnectionId, TaskId};
use crate::repository::RepositoryError;
use crate::state_machine::StateMachineError;

/// Classification of a failure as persisted on a task and reported by `get_task`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad input to an operation (missing field, unknown entity, bad options)
    Validation,
    /// The external system already holds a conflicting record
    Duplicate,
    /// Another task with the same idempotency key is running
    DuplicateInFlight,
    ConnectionNotFound,
    UnsupportedErpType,
    ConnectionInactive,
    /// Network or authentication failure reaching the external system
    ConnectionError,
    /// The task exceeded its wall-clock budget
    Timeout,
    /// Batch finished with some failed items
    PartialFailure,
    /// A bulk run breached the hard memory ceiling
    MemoryLimit,
    /// Persisting task, link or connection state failed
    Storage,
    /// Unexpected adapter failure, including panics
    Internal,
}

impl ErrorKind {
    /// Whether the retry policy may schedule another attempt for this kind
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError | Self::Timeout | Self::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Duplicate => "DUPLICATE",
            Self::DuplicateInFlight => "DUPLICATE_IN_FLIGHT",
            Self::ConnectionNotFound => "CONNECTION_NOT_FOUND",
            Self::UnsupportedErpType => "UNSUPPORTED_ERP_TYPE",
            Self::ConnectionInactive => "CONNECTION_INACTIVE",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::MemoryLimit => "MEMORY_LIMIT",
            Self::Storage => "STORAGE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "VALIDATION" => Ok(Self::Validation),
            "DUPLICATE" => Ok(Self::Duplicate),
            "DUPLICATE_IN_FLIGHT" => Ok(Self::DuplicateInFlight),
            "CONNECTION_NOT_FOUND" => Ok(Self::ConnectionNotFound),
            "UNSUPPORTED_ERP_TYPE" => Ok(Self::UnsupportedErpType),
            "CONNECTION_INACTIVE" => Ok(Self::ConnectionInactive),
            "CONNECTION_ERROR" => Ok(Self::ConnectionError),
            "TIMEOUT" => Ok(Self::Timeout),
            "PARTIAL_FAILURE" => Ok(Self::PartialFailure),
            "MEMORY_LIMIT" => Ok(Self::MemoryLimit),
            "STORAGE" => Ok(Self::Storage),
            "INTERNAL" => Ok(Self::Internal),
            _ => Err(format!("Invalid error kind: {s}")),
        }
    }
}

/// Errors produced by the synchronization core
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task {existing} is already in flight for {key}")]
    DuplicateInFlight { key: String, existing: TaskId },

    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("Connection {0} is inactive")]
    ConnectionInactive(ConnectionId),

    #[error("Unsupported ERP type: {0}")]
    UnsupportedErpType(String),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Operation timed out after {budget_ms}ms")]
    Timeout { budget_ms: u64 },

    #[error("Memory hard limit exceeded: {used_mb}MB used, limit {limit_mb}MB")]
    MemoryLimit { used_mb: u64, limit_mb: u64 },

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Dispatcher unavailable: {0}")]
    DispatcherClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::TaskNotFound(_) | Self::Configuration(_) => {
                ErrorKind::Validation
            }
            Self::DuplicateInFlight { .. } => ErrorKind::DuplicateInFlight,
            Self::ConnectionNotFound(_) => ErrorKind::ConnectionNotFound,
            Self::ConnectionInactive(_) => ErrorKind::ConnectionInactive,
            Self::UnsupportedErpType(_) => ErrorKind::UnsupportedErpType,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::MemoryLimit { .. } => ErrorKind::MemoryLimit,
            Self::Adapter(err) => err.kind(),
            Self::Catalog(CatalogError::Unavailable(_)) => ErrorKind::Storage,
            Self::Catalog(_) => ErrorKind::Validation,
            Self::StateMachine(_) | Self::Repository(_) => ErrorKind::Storage,
            Self::DispatcherClosed(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether the failure came back from (or timed out against) the external system
    pub fn involves_remote(&self) -> bool {
        match self {
            Self::Adapter(error) => error.contacted_remote(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::ConnectionError.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Internal.is_retryable());

        for kind in [
            ErrorKind::Validation,
            ErrorKind::Duplicate,
            ErrorKind::DuplicateInFlight,
            ErrorKind::ConnectionNotFound,
            ErrorKind::UnsupportedErpType,
            ErrorKind::ConnectionInactive,
            ErrorKind::PartialFailure,
            ErrorKind::MemoryLimit,
            ErrorKind::Storage,
        ] {
            assert!(!kind.is_retryable(), "{kind} must not be retried");
        }
    }

    #[test]
    fn test_error_kind_wire_format() {
        let json = serde_json::to_string(&ErrorKind::DuplicateInFlight).unwrap();
        assert_eq!(json, "\"DUPLICATE_IN_FLIGHT\"");
        assert_eq!(
            "UNSUPPORTED_ERP_TYPE".parse::<ErrorKind>().unwrap(),
            ErrorKind::UnsupportedErpType
        );
        assert!("connection_error".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_sync_error_kind_mapping() {
        assert_eq!(
            SyncError::ConnectionInactive(3).kind(),
            ErrorKind::ConnectionInactive
        );
        assert_eq!(
            SyncError::Adapter(AdapterError::Connection("refused".into())).kind(),
            ErrorKind::ConnectionError
        );
        assert!(SyncError::Timeout { budget_ms: 10 }.is_retryable());
        assert!(SyncError::Timeout { budget_ms: 10 }.involves_remote());
        assert!(!SyncError::Validation("bad".into()).involves_remote());
    }
}
