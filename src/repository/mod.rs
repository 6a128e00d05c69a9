//! # Repositories
//!
//! Explicit persistence functions for the three records the engine owns:
//! connections, tasks and entity links. Every call is a single-row read or
//! write keyed by connection id, task id or the (entity, connection) pair;
//! nothing is loaded implicitly.
//!
//! Two backends implement the traits:
//!
//! - [`InMemoryStore`]: `dashmap`-backed, used by tests and embedded callers
//! - `PgSyncStore`: PostgreSQL through `sqlx` (feature `postgres`)
//!
//! [`SyncStore`] bundles one implementation of each trait behind `Arc`s so
//! components can share it cheaply.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::models::{
    CallReport, Connection, ConnectionId, EntityId, EntityLink, HealthPolicy, SyncTask, TaskId,
};

pub use in_memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgSyncStore;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RepositoryError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error.to_string())
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    /// Insert or replace the configuration and state of a connection
    async fn upsert(&self, connection: &Connection) -> RepositoryResult<()>;

    async fn get(&self, connection_id: ConnectionId) -> RepositoryResult<Option<Connection>>;

    async fn list_active(&self) -> RepositoryResult<Vec<Connection>>;

    /// Atomically fold one call report into the stored connection
    async fn record_call(
        &self,
        connection_id: ConnectionId,
        report: &CallReport,
        policy: &HealthPolicy,
    ) -> RepositoryResult<Connection>;

    /// Set only the next scheduled bulk run, leaving health untouched
    async fn schedule_next(
        &self,
        connection_id: ConnectionId,
        at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: &SyncTask) -> RepositoryResult<()>;

    /// Persist the full current state of an existing task
    async fn save(&self, task: &SyncTask) -> RepositoryResult<()>;

    async fn get(&self, task_id: TaskId) -> RepositoryResult<Option<SyncTask>>;
}

#[async_trait]
pub trait LinkRepository: Send + Sync {
    /// Return the link for the pair, creating a pending one if none exists.
    /// Concurrent callers always observe the same single row.
    async fn find_or_create(
        &self,
        entity_id: EntityId,
        connection_id: ConnectionId,
        now: DateTime<Utc>,
    ) -> RepositoryResult<EntityLink>;

    async fn find(
        &self,
        entity_id: EntityId,
        connection_id: ConnectionId,
    ) -> RepositoryResult<Option<EntityLink>>;

    async fn find_by_external_id(
        &self,
        connection_id: ConnectionId,
        external_id: &str,
    ) -> RepositoryResult<Option<EntityLink>>;

    async fn save(&self, link: &EntityLink) -> RepositoryResult<()>;

    /// Links that carry an external id, ordered by entity id, after `after`
    async fn list_linked(
        &self,
        connection_id: ConnectionId,
        after: Option<EntityId>,
        limit: usize,
    ) -> RepositoryResult<Vec<EntityLink>>;

    async fn count_linked(&self, connection_id: ConnectionId) -> RepositoryResult<u64>;

    /// Links a linked push must visit: those with an external id plus
    /// pending or errored links that never reached the ERP
    async fn list_push_candidates(
        &self,
        connection_id: ConnectionId,
        after: Option<EntityId>,
        limit: usize,
    ) -> RepositoryResult<Vec<EntityLink>>;

    async fn count_push_candidates(&self, connection_id: ConnectionId) -> RepositoryResult<u64>;
}

/// Shared handle to the three repositories
#[derive(Clone)]
pub struct SyncStore {
    pub connections: Arc<dyn ConnectionRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub links: Arc<dyn LinkRepository>,
}

impl SyncStore {
    pub fn new(
        connections: Arc<dyn ConnectionRepository>,
        tasks: Arc<dyn TaskRepository>,
        links: Arc<dyn LinkRepository>,
    ) -> Self {
        Self {
            connections,
            tasks,
            links,
        }
    }

    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::new(store.clone(), store.clone(), store)
    }

    #[cfg(feature = "postgres")]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let store = Arc::new(PgSyncStore::new(pool));
        Self::new(store.clone(), store.clone(), store)
    }
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore").finish_non_exhaustive()
    }
}
