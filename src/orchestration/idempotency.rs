//! # Idempotency Registry
//!
//! Atomic acquire-or-refuse claims keyed by `(task kind, entity, connection)`.
//!
//! A worker holds an [`IdempotencyGuard`] for the whole life of a task,
//! retries and backoff sleeps included. Dropping the guard releases the key,
//! but only if it still belongs to the same task, so a late drop can never
//! free a key another task has since claimed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::models::{ConnectionId, EntityId, SyncTask, TaskId, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub kind: TaskKind,
    pub entity_id: Option<EntityId>,
    pub connection_id: ConnectionId,
}

impl IdempotencyKey {
    pub fn new(kind: TaskKind, entity_id: Option<EntityId>, connection_id: ConnectionId) -> Self {
        Self {
            kind,
            entity_id,
            connection_id,
        }
    }

    pub fn for_task(task: &SyncTask) -> Self {
        Self::new(task.kind, task.entity_id, task.connection_id)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity_id {
            Some(entity_id) => write!(f, "{}:{}:{}", self.kind, entity_id, self.connection_id),
            None => write!(f, "{}:*:{}", self.kind, self.connection_id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdempotencyRegistry {
    in_flight: Arc<DashMap<IdempotencyKey, TaskId>>,
}

impl IdempotencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `task_id`, or return the task already holding it
    pub fn try_acquire(
        &self,
        key: IdempotencyKey,
        task_id: TaskId,
    ) -> Result<IdempotencyGuard, TaskId> {
        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => Err(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(task_id);
                debug!(key = %key, task_id = %task_id, "Idempotency key acquired");
                Ok(IdempotencyGuard {
                    registry: Arc::clone(&self.in_flight),
                    key,
                    task_id,
                })
            }
        }
    }

    pub fn holder(&self, key: &IdempotencyKey) -> Option<TaskId> {
        self.in_flight.get(key).map(|entry| *entry.value())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Releases its key on drop
#[derive(Debug)]
pub struct IdempotencyGuard {
    registry: Arc<DashMap<IdempotencyKey, TaskId>>,
    key: IdempotencyKey,
    task_id: TaskId,
}

impl IdempotencyGuard {
    pub fn key(&self) -> IdempotencyKey {
        self.key
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Drop for IdempotencyGuard {
    fn drop(&mut self) {
        let task_id = self.task_id;
        self.registry.remove_if(&self.key, |_, holder| *holder == task_id);
        debug!(key = %self.key, task_id = %task_id, "Idempotency key released");
    }
}
