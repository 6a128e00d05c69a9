//! # Catalog Boundary
//!
//! The product catalog is owned by another part of the system; the engine
//! only needs to read entities for pushes and write upstream records back on
//! pulls. [`CatalogStore`] is that boundary.
//!
//! Ids are assigned by the catalog and are strictly increasing, so
//! `list_entities(after, limit)` doubles as a resumable cursor for bulk
//! pushes in full mode.

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{CatalogEntity, EntityId, ImportOutcome, UpstreamRecord};

pub use in_memory::InMemoryCatalog;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Entity {0} not found in catalog")]
    EntityNotFound(EntityId),

    #[error("Upstream record {external_id} rejected: {reason}")]
    Rejected { external_id: String, reason: String },

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_entity(&self, entity_id: EntityId) -> CatalogResult<Option<CatalogEntity>>;

    /// Entities ordered by id, strictly after `after`
    async fn list_entities(
        &self,
        after: Option<EntityId>,
        limit: usize,
    ) -> CatalogResult<Vec<CatalogEntity>>;

    async fn count_entities(&self) -> CatalogResult<u64>;

    /// Create or update a catalog entity from an upstream record.
    ///
    /// `existing` is the entity already linked to the record, if any. Without
    /// it the catalog may match on SKU before creating a new entity.
    async fn apply_upstream(
        &self,
        existing: Option<EntityId>,
        record: &UpstreamRecord,
        now: DateTime<Utc>,
    ) -> CatalogResult<ImportOutcome>;
}
