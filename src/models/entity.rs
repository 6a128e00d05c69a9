//! Catalog-side entity shapes.
//!
//! The product catalog itself is an external collaborator; these are the
//! shapes the orchestrator exchanges with it and with adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::sync_task::SyncOptions;
use super::EntityId;

/// A catalog entity as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub entity_id: EntityId,
    pub sku: String,
    pub fields: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
    /// Routes single-entity tasks to the high priority queue
    pub important: bool,
}

impl CatalogEntity {
    pub fn new(entity_id: EntityId, sku: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            sku: sku.into(),
            fields: Map::new(),
            updated_at,
            important: false,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn important(mut self) -> Self {
        self.important = true;
        self
    }
}

/// One record as returned by an upstream listing or single pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRecord {
    pub external_id: String,
    pub sku: Option<String>,
    pub data: Map<String, Value>,
    /// Upstream last-modified marker; `None` when the system cannot report one
    pub modified_at: Option<DateTime<Utc>>,
}

/// Result of writing an upstream record into the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub entity_id: EntityId,
    pub created: bool,
    pub changed: bool,
}

/// Pick the fields to send on a push.
///
/// An explicit `options.fields` list wins. Otherwise an already-linked entity
/// sends only its pending fields, and anything else sends every field.
pub fn select_payload(
    entity: &CatalogEntity,
    options: &SyncOptions,
    pending_fields: &[String],
    already_linked: bool,
) -> Map<String, Value> {
    let wanted: Option<&[String]> = if !options.fields.is_empty() {
        Some(&options.fields)
    } else if already_linked && !pending_fields.is_empty() {
        Some(pending_fields)
    } else {
        None
    };

    match wanted {
        Some(names) => entity
            .fields
            .iter()
            .filter(|(name, _)| names.iter().any(|wanted| wanted == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        None => entity.fields.clone(),
    }
}
