//! # Entity Synchronization
//!
//! Single-entity push and pull, shared by the task executor (`push_one`,
//! `pull_one`) and the batch synchronizer. Each operation:
//!
//! 1. finds or creates the entity's link for the connection
//! 2. calls the adapter (panics become `INTERNAL` errors)
//! 3. writes the outcome back to the link: `synced` with fresh timestamps on
//!    success, `error` with the message and a bumped retry count on failure
//!
//! A known external id is always passed back to the adapter, so retrying a
//! push updates the record created by an earlier attempt instead of creating
//! a second one.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapter::{call_guarded, ErpAdapter, PullOutcome, PullTarget, PushOutcome, PushRequest};
use crate::catalog::CatalogStore;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::models::{
    select_payload, CatalogEntity, Connection, ConnectionId, EntityId, EntityLink, ImportOutcome,
    ItemFailure, SyncOptions, UpstreamRecord,
};
use crate::repository::SyncStore;

/// Collaborators every synchronization component needs
#[derive(Clone)]
pub struct SyncContext {
    pub store: SyncStore,
    pub catalog: Arc<dyn CatalogStore>,
    pub clock: Arc<dyn Clock>,
}

impl SyncContext {
    pub fn new(store: SyncStore, catalog: Arc<dyn CatalogStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("store", &self.store)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PushedEntity {
    pub outcome: PushOutcome,
    pub link: EntityLink,
    pub payload_bytes: u64,
    /// Stock/price sub-items that ran
    pub sub_items: Vec<&'static str>,
    pub sub_failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone)]
pub struct PulledEntity {
    pub outcome: PullOutcome,
    pub import: ImportOutcome,
    pub link: EntityLink,
}

fn payload_size(payload: &Map<String, Value>) -> u64 {
    serde_json::to_vec(payload)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}

impl SyncContext {
    /// Push one catalog entity, then run the stock/price sub-items it asks for
    pub async fn push_entity(
        &self,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
        entity: &CatalogEntity,
        options: &SyncOptions,
    ) -> Result<PushedEntity> {
        let mut link = self
            .store
            .links
            .find_or_create(entity.entity_id, connection.connection_id, self.clock.now())
            .await?;

        let payload = select_payload(
            entity,
            options,
            &link.pending_fields,
            link.external_id.is_some(),
        );

        let result = {
            let request = PushRequest {
                entity,
                external_id: link.external_id.as_deref(),
                payload: &payload,
                options,
            };
            call_guarded(adapter.push_entity(connection, &request)).await
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                link.mark_error(error.to_string(), self.clock.now());
                self.store.links.save(&link).await?;
                warn!(
                    entity_id = entity.entity_id,
                    connection_id = connection.connection_id,
                    error = %error,
                    "Entity push failed"
                );
                return Err(error.into());
            }
        };

        link.mark_pushed(
            outcome.external_id.clone(),
            &payload,
            &entity.fields,
            self.clock.now(),
        );
        self.store.links.save(&link).await?;
        debug!(
            entity_id = entity.entity_id,
            connection_id = connection.connection_id,
            external_id = link.external_id.as_deref().unwrap_or(""),
            fields = payload.len(),
            "Entity pushed"
        );

        let (sub_items, sub_failures) = self
            .run_sub_items(connection, adapter, entity, &link, options)
            .await;

        Ok(PushedEntity {
            outcome,
            payload_bytes: payload_size(&payload),
            link,
            sub_items,
            sub_failures,
        })
    }

    async fn run_sub_items(
        &self,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
        entity: &CatalogEntity,
        link: &EntityLink,
        options: &SyncOptions,
    ) -> (Vec<&'static str>, Vec<ItemFailure>) {
        let mut ran = Vec::new();
        let mut failures = Vec::new();
        let external_id = link.external_id.as_deref();

        if options.sync_stock {
            ran.push("stock");
            if let Err(error) =
                call_guarded(adapter.sync_stock(connection, entity, external_id)).await
            {
                failures.push(ItemFailure {
                    entity_id: Some(entity.entity_id),
                    external_id: link.external_id.clone(),
                    kind: error.kind(),
                    message: format!("stock: {error}"),
                });
            }
        }
        if options.sync_prices {
            ran.push("prices");
            if let Err(error) =
                call_guarded(adapter.sync_prices(connection, entity, external_id)).await
            {
                failures.push(ItemFailure {
                    entity_id: Some(entity.entity_id),
                    external_id: link.external_id.clone(),
                    kind: error.kind(),
                    message: format!("prices: {error}"),
                });
            }
        }
        (ran, failures)
    }

    /// Pull one entity and write it into the catalog and its link
    pub async fn pull_entity(
        &self,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
        entity_id: EntityId,
        link: Option<EntityLink>,
    ) -> Result<PulledEntity> {
        let entity = self.catalog.load_entity(entity_id).await?;
        let external_id = link.as_ref().and_then(|link| link.external_id.clone());
        if entity.is_none() && external_id.is_none() {
            return Err(SyncError::Validation(format!(
                "entity {entity_id} is neither in the catalog nor linked to connection {}",
                connection.connection_id
            )));
        }

        let sku = entity.map(|entity| entity.sku);
        let target = PullTarget {
            entity_id,
            sku: sku.clone(),
            external_id,
        };
        let result = call_guarded(adapter.pull_entity(connection, &target)).await;

        let mut link = match link {
            Some(link) => link,
            None => {
                self.store
                    .links
                    .find_or_create(entity_id, connection.connection_id, self.clock.now())
                    .await?
            }
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                link.mark_error(error.to_string(), self.clock.now());
                self.store.links.save(&link).await?;
                return Err(error.into());
            }
        };

        let now = self.clock.now();
        let record = UpstreamRecord {
            external_id: outcome.external_id.clone(),
            sku,
            data: outcome.data.clone(),
            modified_at: outcome.modified_at,
        };
        let import = match self.catalog.apply_upstream(Some(entity_id), &record, now).await {
            Ok(import) => import,
            Err(error) => {
                link.mark_error(error.to_string(), now);
                self.store.links.save(&link).await?;
                return Err(error.into());
            }
        };

        link.mark_pulled(Some(outcome.external_id.clone()), outcome.data.clone(), now);
        self.store.links.save(&link).await?;

        Ok(PulledEntity {
            outcome,
            import,
            link,
        })
    }

    /// Apply one record from an upstream listing, linking it to its catalog entity
    pub async fn apply_record(
        &self,
        connection_id: ConnectionId,
        record: &UpstreamRecord,
    ) -> Result<ImportOutcome> {
        let existing = self
            .store
            .links
            .find_by_external_id(connection_id, &record.external_id)
            .await?;
        let now = self.clock.now();
        let import = self
            .catalog
            .apply_upstream(existing.as_ref().map(|link| link.entity_id), record, now)
            .await?;

        let mut link = match existing {
            Some(link) if link.entity_id == import.entity_id => link,
            _ => {
                self.store
                    .links
                    .find_or_create(import.entity_id, connection_id, now)
                    .await?
            }
        };
        link.mark_pulled(Some(record.external_id.clone()), record.data.clone(), now);
        self.store.links.save(&link).await?;
        Ok(import)
    }

    /// Put a link into `error` after a task-level failure (e.g. a timeout)
    pub async fn record_link_error(
        &self,
        entity_id: EntityId,
        connection_id: ConnectionId,
        message: &str,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut link = self
            .store
            .links
            .find_or_create(entity_id, connection_id, now)
            .await?;
        link.mark_error(message, now);
        self.store.links.save(&link).await?;
        Ok(())
    }
}
