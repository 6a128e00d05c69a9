//! In-memory catalog used by tests and embedded deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{CatalogError, CatalogResult, CatalogStore};
use crate::models::{CatalogEntity, EntityId, ImportOutcome, UpstreamRecord};

#[derive(Debug, Default)]
struct CatalogState {
    entities: BTreeMap<EntityId, CatalogEntity>,
    next_id: EntityId,
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity, keeping the id sequence ahead of it
    pub fn insert(&self, entity: CatalogEntity) {
        let mut state = self.state.write();
        state.next_id = state.next_id.max(entity.entity_id);
        state.entities.insert(entity.entity_id, entity);
    }

    pub fn get(&self, entity_id: EntityId) -> Option<CatalogEntity> {
        self.state.read().entities.get(&entity_id).cloned()
    }

    /// Simulate a local edit: overwrite a field and bump `updated_at`
    pub fn touch(
        &self,
        entity_id: EntityId,
        field: &str,
        value: Value,
        now: DateTime<Utc>,
    ) -> CatalogResult<()> {
        let mut state = self.state.write();
        let entity = state
            .entities
            .get_mut(&entity_id)
            .ok_or(CatalogError::EntityNotFound(entity_id))?;
        entity.fields.insert(field.to_string(), value);
        entity.updated_at = now;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn differs(current: &Map<String, Value>, incoming: &Map<String, Value>) -> bool {
    incoming
        .iter()
        .any(|(name, value)| current.get(name) != Some(value))
}

#[async_trait]
impl CatalogStore for InMemoryCatalog {
    async fn load_entity(&self, entity_id: EntityId) -> CatalogResult<Option<CatalogEntity>> {
        Ok(self.get(entity_id))
    }

    async fn list_entities(
        &self,
        after: Option<EntityId>,
        limit: usize,
    ) -> CatalogResult<Vec<CatalogEntity>> {
        let state = self.state.read();
        let entities = match after {
            Some(after) => state
                .entities
                .range(after.saturating_add(1)..)
                .take(limit)
                .map(|(_, entity)| entity.clone())
                .collect(),
            None => state.entities.values().take(limit).cloned().collect(),
        };
        Ok(entities)
    }

    async fn count_entities(&self) -> CatalogResult<u64> {
        Ok(self.state.read().entities.len() as u64)
    }

    async fn apply_upstream(
        &self,
        existing: Option<EntityId>,
        record: &UpstreamRecord,
        now: DateTime<Utc>,
    ) -> CatalogResult<ImportOutcome> {
        let mut state = self.state.write();

        let target = existing.or_else(|| {
            record.sku.as_ref().and_then(|sku| {
                state
                    .entities
                    .values()
                    .find(|entity| &entity.sku == sku)
                    .map(|entity| entity.entity_id)
            })
        });

        if let Some(entity_id) = target {
            if let Some(entity) = state.entities.get_mut(&entity_id) {
                let changed = differs(&entity.fields, &record.data);
                if changed {
                    for (name, value) in &record.data {
                        entity.fields.insert(name.clone(), value.clone());
                    }
                    entity.updated_at = now;
                }
                return Ok(ImportOutcome {
                    entity_id,
                    created: false,
                    changed,
                });
            }
        }

        let sku = record.sku.clone().ok_or_else(|| CatalogError::Rejected {
            external_id: record.external_id.clone(),
            reason: "new entities require a SKU".to_string(),
        })?;

        state.next_id += 1;
        let entity_id = state.next_id;
        let mut entity = CatalogEntity::new(entity_id, sku, now);
        entity.fields = record.data.clone();
        state.entities.insert(entity_id, entity);

        Ok(ImportOutcome {
            entity_id,
            created: true,
            changed: true,
        })
    }
}
