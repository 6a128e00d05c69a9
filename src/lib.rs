#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # ERP Sync Core
//!
//! Orchestration core that keeps a product catalog synchronized with
//! external ERP systems.
//!
//! ## Overview
//!
//! The core owns the lifecycle of synchronization work: tasks are enqueued,
//! deduplicated by idempotency key, executed with retries and timeouts, and
//! every external call is folded into the health of its connection. Bulk
//! operations run in chunks with persisted checkpoints, per-item error
//! isolation and memory guards. A change detector probes each connection
//! cheaply and dispatches incremental pulls when the upstream changed.
//!
//! ERP-specific behavior lives behind the [`adapter::ErpAdapter`] trait; the
//! catalog is reached through [`catalog::CatalogStore`]. Neither is
//! implemented for a real vendor here.
//!
//! ## Module Organization
//!
//! - [`models`] - Connections, sync tasks, entity links and catalog shapes
//! - [`state_machine`] - Task status transitions
//! - [`repository`] - Persistence traits with in-memory and PostgreSQL stores
//! - [`adapter`] - ERP adapter contract and registry
//! - [`catalog`] - Catalog access contract
//! - [`orchestration`] - Dispatcher, executor, batch synchronizer, detector, scheduler
//! - [`config`] - Layered TOML/environment configuration
//! - [`error`] - Error type and the error-kind taxonomy
//! - [`logging`] - `tracing` subscriber setup and structured log helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use erp_sync_core::adapter::AdapterRegistry;
//! use erp_sync_core::catalog::InMemoryCatalog;
//! use erp_sync_core::clock::SystemClock;
//! use erp_sync_core::config::SyncConfig;
//! use erp_sync_core::models::TaskKind;
//! use erp_sync_core::orchestration::{EnqueueRequest, SyncContext, TaskDispatcher, TaskExecutor};
//! use erp_sync_core::repository::SyncStore;
//!
//! # async fn example() -> erp_sync_core::Result<()> {
//! let config = SyncConfig::default();
//! let context = SyncContext::new(
//!     SyncStore::in_memory(),
//!     Arc::new(InMemoryCatalog::new()),
//!     Arc::new(SystemClock),
//! );
//! let executor = Arc::new(TaskExecutor::new(context, Arc::new(AdapterRegistry::new()), &config));
//! let (dispatcher, handle) = TaskDispatcher::start(executor, &config.executor);
//!
//! let receipt = dispatcher
//!     .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(42))
//!     .await?;
//! let status = dispatcher.get_task(receipt.task_id).await?;
//! println!("{} is {}", status.task_id, status.status);
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod repository;
pub mod state_machine;

pub use adapter::{AdapterError, AdapterRegistry, ErpAdapter};
pub use catalog::{CatalogError, CatalogStore, InMemoryCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigManager, SyncConfig};
pub use error::{ErrorKind, Result, SyncError};
pub use models::{
    Connection, EntityLink, ErpType, HealthStatus, LinkStatus, SyncMode, SyncTask, TaskKind,
};
pub use orchestration::{
    ChangeDetector, DetectionOutcome, EnqueueReceipt, EnqueueRequest, SyncContext, SyncScheduler,
    TaskDispatcher, TaskExecutor,
};
pub use repository::SyncStore;
pub use state_machine::TaskState;
