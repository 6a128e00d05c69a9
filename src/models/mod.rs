//! # Domain Models
//!
//! Plain structs for the three persisted records (connections, tasks, links)
//! and the catalog-side entity shapes the orchestrator reads. Relations are
//! never loaded implicitly: repositories return these structs and callers ask
//! for related rows explicitly.

pub mod connection;
pub mod entity;
pub mod link;
pub mod sync_task;

use uuid::Uuid;

pub type TaskId = Uuid;
pub type ConnectionId = i64;
pub type EntityId = i64;

pub use connection::{
    CallOutcome, CallReport, Connection, ConnectionStats, ErpType, HealthPolicy, HealthStatus,
    SchedulePolicy, SyncMode,
};
pub use entity::{select_payload, CatalogEntity, ImportOutcome, UpstreamRecord};
pub use link::{EntityLink, LinkStatus};
pub use sync_task::{
    BatchReport, Checkpoint, ErrorDetails, ItemFailure, PullMode, SyncOptions, SyncTask,
    TaskFilters, TaskKind, TaskMetadata, TaskQueue, TaskStatusView, TimeoutClass,
};
