//! # ERP Adapters
//!
//! The capability interface implemented once per external system type. The
//! orchestrator never knows which ERP it talks to: it resolves an
//! [`ErpAdapter`] through the [`AdapterRegistry`] and calls the operation the
//! task kind implies.
//!
//! ## Contract
//!
//! | Operation | Used by |
//! |---|---|
//! | `push_entity` | `push_one`, `push_all` |
//! | `pull_entity` | `pull_one`, linked pulls of changed entities |
//! | `pull_all` (paged) | `pull_all`, `pull_incremental` |
//! | `fetch_change_markers` | fast-path comparison in linked pulls |
//! | `count_modified_since` | change detector probe |
//! | `sync_stock` / `sync_prices` | push sub-items |
//! | `health_check` | `health_check` probe |
//!
//! Adapters report failures as [`AdapterError`]; the variant decides both the
//! persisted [`ErrorKind`] and whether the external system actually answered
//! (which in turn decides connection health).

pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::models::{CatalogEntity, Connection, EntityId, ErpType, PullMode, SyncOptions, UpstreamRecord};

pub use registry::AdapterRegistry;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The external system refused the payload as invalid
    #[error("Rejected by external system: {0}")]
    Validation(String),

    /// The external system already holds a conflicting record
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Network, DNS, TLS or authentication failure
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Record not found upstream: {0}")]
    NotFound(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Unexpected failure on the remote side, or a panic inside the adapter
    #[error("Remote error: {0}")]
    Remote(String),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NotFound(_) => ErrorKind::Validation,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::Connection(_) => ErrorKind::ConnectionError,
            Self::Unsupported(_) => ErrorKind::UnsupportedErpType,
            Self::Remote(_) => ErrorKind::Internal,
        }
    }

    /// True when the external system answered and refused; health stays `connected`
    pub fn reached_remote(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Duplicate(_) | Self::NotFound(_)
        )
    }

    /// False when the adapter declined the operation without calling out;
    /// such failures say nothing about connection health
    pub fn contacted_remote(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// One push of a catalog entity
#[derive(Debug, Clone)]
pub struct PushRequest<'a> {
    pub entity: &'a CatalogEntity,
    /// Known external id; `None` asks the adapter to create the record
    pub external_id: Option<&'a str>,
    /// Fields selected for this push
    pub payload: &'a Map<String, Value>,
    pub options: &'a SyncOptions,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushOutcome {
    pub external_id: Option<String>,
    pub message: String,
    pub updated_fields: Vec<String>,
    pub rows_affected: Option<u64>,
}

/// Which upstream record a single pull targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullTarget {
    pub entity_id: EntityId,
    pub sku: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullOutcome {
    pub external_id: String,
    pub data: Map<String, Value>,
    pub modified_at: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub mode: PullMode,
    pub since: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpstreamPage {
    pub records: Vec<UpstreamRecord>,
    /// `None` on the last page
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubItemOutcome {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub latency_ms: u64,
    pub detail: String,
}

/// Per-external-id last-modified markers.
///
/// A missing key means the record no longer exists upstream; a `None` value
/// means the system cannot say when it changed.
pub type ChangeMarkers = HashMap<String, Option<DateTime<Utc>>>;

#[async_trait]
pub trait ErpAdapter: Send + Sync {
    fn erp_type(&self) -> ErpType;

    async fn push_entity(
        &self,
        connection: &Connection,
        request: &PushRequest<'_>,
    ) -> AdapterResult<PushOutcome>;

    async fn pull_entity(
        &self,
        connection: &Connection,
        target: &PullTarget,
    ) -> AdapterResult<PullOutcome>;

    async fn pull_all(
        &self,
        connection: &Connection,
        request: &PageRequest,
    ) -> AdapterResult<UpstreamPage>;

    /// Default: no marker support, every id is reported with an unknown marker
    async fn fetch_change_markers(
        &self,
        _connection: &Connection,
        external_ids: &[String],
    ) -> AdapterResult<ChangeMarkers> {
        Ok(external_ids.iter().map(|id| (id.clone(), None)).collect())
    }

    async fn count_modified_since(
        &self,
        _connection: &Connection,
        _since: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        Err(AdapterError::Unsupported(format!(
            "{} cannot count upstream modifications",
            self.erp_type()
        )))
    }

    async fn sync_stock(
        &self,
        _connection: &Connection,
        _entity: &CatalogEntity,
        _external_id: Option<&str>,
    ) -> AdapterResult<SubItemOutcome> {
        Err(AdapterError::Unsupported(format!(
            "{} has no stock endpoint",
            self.erp_type()
        )))
    }

    async fn sync_prices(
        &self,
        _connection: &Connection,
        _entity: &CatalogEntity,
        _external_id: Option<&str>,
    ) -> AdapterResult<SubItemOutcome> {
        Err(AdapterError::Unsupported(format!(
            "{} has no price endpoint",
            self.erp_type()
        )))
    }

    async fn health_check(&self, connection: &Connection) -> AdapterResult<HealthReport>;
}

/// Await an adapter future, turning a panic into [`AdapterError::Remote`]
pub async fn call_guarded<T, F>(future: F) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "adapter panicked".to_string());
            Err(AdapterError::Remote(format!("adapter panicked: {message}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            AdapterError::Connection("refused".into()).kind(),
            ErrorKind::ConnectionError
        );
        assert_eq!(AdapterError::Remote("500".into()).kind(), ErrorKind::Internal);
        assert_eq!(
            AdapterError::Duplicate("sku".into()).kind(),
            ErrorKind::Duplicate
        );
        assert!(AdapterError::Validation("x".into()).reached_remote());
        assert!(!AdapterError::Connection("x".into()).reached_remote());
        assert!(!AdapterError::Remote("x".into()).reached_remote());
        assert!(!AdapterError::Unsupported("x".into()).reached_remote());
        assert!(!AdapterError::Unsupported("x".into()).contacted_remote());
        assert!(AdapterError::Connection("x".into()).contacted_remote());
    }

    #[tokio::test]
    async fn test_call_guarded_maps_panics() {
        let result: AdapterResult<u8> = call_guarded(async { panic!("boom") }).await;
        match result {
            Err(AdapterError::Remote(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected result: {other:?}"),
        }

        let ok = call_guarded(async { Ok::<_, AdapterError>(7) }).await;
        assert_eq!(ok, Ok(7));
    }
}
