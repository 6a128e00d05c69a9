//! # In-Memory Store
//!
//! `dashmap`-backed implementation of all three repositories, for tests and
//! for embedding the engine without a database. Row-level atomicity comes
//! from the shard locks: `find_or_create` and `record_call` run under the
//! entry lock of the row they touch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    ConnectionRepository, LinkRepository, RepositoryError, RepositoryResult, TaskRepository,
};
use crate::models::{
    CallReport, Connection, ConnectionId, EntityId, EntityLink, HealthPolicy, SyncTask, TaskId,
};
use crate::state_machine::TaskState;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    connections: DashMap<ConnectionId, Connection>,
    tasks: DashMap<TaskId, SyncTask>,
    links: DashMap<(EntityId, ConnectionId), EntityLink>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Snapshot of every stored task currently in `status`
    pub fn tasks_in_state(&self, status: TaskState) -> Vec<SyncTask> {
        self.tasks
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl ConnectionRepository for InMemoryStore {
    async fn upsert(&self, connection: &Connection) -> RepositoryResult<()> {
        self.connections
            .insert(connection.connection_id, connection.clone());
        Ok(())
    }

    async fn get(&self, connection_id: ConnectionId) -> RepositoryResult<Option<Connection>> {
        Ok(self
            .connections
            .get(&connection_id)
            .map(|entry| entry.value().clone()))
    }

    async fn list_active(&self) -> RepositoryResult<Vec<Connection>> {
        let mut active: Vec<Connection> = self
            .connections
            .iter()
            .filter(|entry| entry.is_active)
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by_key(|connection| connection.connection_id);
        Ok(active)
    }

    async fn record_call(
        &self,
        connection_id: ConnectionId,
        report: &CallReport,
        policy: &HealthPolicy,
    ) -> RepositoryResult<Connection> {
        let mut entry =
            self.connections
                .get_mut(&connection_id)
                .ok_or_else(|| RepositoryError::NotFound {
                    entity: "connection",
                    id: connection_id.to_string(),
                })?;
        entry.apply_call_report(report, policy);
        Ok(entry.value().clone())
    }

    async fn schedule_next(
        &self,
        connection_id: ConnectionId,
        at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        let mut entry =
            self.connections
                .get_mut(&connection_id)
                .ok_or_else(|| RepositoryError::NotFound {
                    entity: "connection",
                    id: connection_id.to_string(),
                })?;
        entry.next_scheduled_sync_at = at;
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn insert(&self, task: &SyncTask) -> RepositoryResult<()> {
        match self.tasks.entry(task.task_id) {
            Entry::Occupied(_) => Err(RepositoryError::AlreadyExists {
                entity: "task",
                id: task.task_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                Ok(())
            }
        }
    }

    async fn save(&self, task: &SyncTask) -> RepositoryResult<()> {
        let mut entry = self
            .tasks
            .get_mut(&task.task_id)
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "task",
                id: task.task_id.to_string(),
            })?;
        *entry = task.clone();
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> RepositoryResult<Option<SyncTask>> {
        Ok(self.tasks.get(&task_id).map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl LinkRepository for InMemoryStore {
    async fn find_or_create(
        &self,
        entity_id: EntityId,
        connection_id: ConnectionId,
        now: DateTime<Utc>,
    ) -> RepositoryResult<EntityLink> {
        let entry = self
            .links
            .entry((entity_id, connection_id))
            .or_insert_with(|| EntityLink::new(entity_id, connection_id, now));
        Ok(entry.value().clone())
    }

    async fn find(
        &self,
        entity_id: EntityId,
        connection_id: ConnectionId,
    ) -> RepositoryResult<Option<EntityLink>> {
        Ok(self
            .links
            .get(&(entity_id, connection_id))
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_external_id(
        &self,
        connection_id: ConnectionId,
        external_id: &str,
    ) -> RepositoryResult<Option<EntityLink>> {
        Ok(self
            .links
            .iter()
            .find(|entry| {
                entry.connection_id == connection_id
                    && entry.external_id.as_deref() == Some(external_id)
            })
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, link: &EntityLink) -> RepositoryResult<()> {
        self.links
            .insert((link.entity_id, link.connection_id), link.clone());
        Ok(())
    }

    async fn list_linked(
        &self,
        connection_id: ConnectionId,
        after: Option<EntityId>,
        limit: usize,
    ) -> RepositoryResult<Vec<EntityLink>> {
        let mut links: Vec<EntityLink> = self
            .links
            .iter()
            .filter(|entry| {
                entry.connection_id == connection_id
                    && entry.external_id.is_some()
                    && after.map_or(true, |after| entry.entity_id > after)
            })
            .map(|entry| entry.value().clone())
            .collect();
        links.sort_by_key(|link| link.entity_id);
        links.truncate(limit);
        Ok(links)
    }

    async fn count_linked(&self, connection_id: ConnectionId) -> RepositoryResult<u64> {
        Ok(self
            .links
            .iter()
            .filter(|entry| entry.connection_id == connection_id && entry.external_id.is_some())
            .count() as u64)
    }

    async fn list_push_candidates(
        &self,
        connection_id: ConnectionId,
        after: Option<EntityId>,
        limit: usize,
    ) -> RepositoryResult<Vec<EntityLink>> {
        let mut links: Vec<EntityLink> = self
            .links
            .iter()
            .filter(|entry| {
                entry.connection_id == connection_id
                    && (entry.external_id.is_some() || entry.needs_sync())
                    && after.map_or(true, |after| entry.entity_id > after)
            })
            .map(|entry| entry.value().clone())
            .collect();
        links.sort_by_key(|link| link.entity_id);
        links.truncate(limit);
        Ok(links)
    }

    async fn count_push_candidates(&self, connection_id: ConnectionId) -> RepositoryResult<u64> {
        Ok(self
            .links
            .iter()
            .filter(|entry| {
                entry.connection_id == connection_id
                    && (entry.external_id.is_some() || entry.needs_sync())
            })
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CallOutcome, ErpType, HealthStatus, LinkStatus, TaskKind};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 4, 4, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_find_or_create_never_duplicates() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.find_or_create(10, 1, now()).await.unwrap()
            }));
        }
        for handle in handles {
            let link = handle.await.unwrap();
            assert_eq!((link.entity_id, link.connection_id), (10, 1));
        }
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test]
    async fn test_list_linked_orders_and_pages() {
        let store = InMemoryStore::new();
        for entity_id in [5, 1, 3, 4, 2] {
            let mut link = EntityLink::new(entity_id, 1, now());
            link.external_id = Some(format!("EXT-{entity_id}"));
            LinkRepository::save(&store, &link).await.unwrap();
        }
        // Unlinked pair and a different connection are excluded
        LinkRepository::save(&store, &EntityLink::new(6, 1, now()))
            .await
            .unwrap();
        let mut other = EntityLink::new(7, 2, now());
        other.external_id = Some("EXT-7".into());
        LinkRepository::save(&store, &other).await.unwrap();

        let first = store.list_linked(1, None, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|l| l.entity_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        let rest = store.list_linked(1, Some(2), 10).await.unwrap();
        assert_eq!(
            rest.iter().map(|l| l.entity_id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(store.count_linked(1).await.unwrap(), 5);
        assert_eq!(
            store
                .find_by_external_id(1, "EXT-4")
                .await
                .unwrap()
                .map(|l| l.entity_id),
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_record_call_updates_stored_connection() {
        let store = InMemoryStore::new();
        store
            .upsert(&Connection::new(1, "shop", ErpType::Baselinker, now()))
            .await
            .unwrap();

        let updated = store
            .record_call(
                1,
                &CallReport::new(now(), CallOutcome::Failed("refused".into())),
                &HealthPolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(updated.health, HealthStatus::Error);

        let stored = ConnectionRepository::get(&store, 1).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("refused"));

        let missing = store
            .record_call(
                99,
                &CallReport::new(now(), CallOutcome::Success),
                &HealthPolicy::default(),
            )
            .await;
        assert!(matches!(missing, Err(RepositoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_task_insert_and_save() {
        let store = InMemoryStore::new();
        let mut task = SyncTask::new(TaskKind::PullLinked, 1, None, now());
        store.insert(&task).await.unwrap();
        assert!(store.insert(&task).await.is_err());

        task.start(now()).unwrap();
        TaskRepository::save(&store, &task).await.unwrap();
        let stored = TaskRepository::get(&store, task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.status.is_active());
    }

    #[tokio::test]
    async fn test_concurrent_task_inserts_admit_one() {
        let store = Arc::new(InMemoryStore::new());
        let task = SyncTask::new(TaskKind::PushAll, 1, None, now());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let task = task.clone();
            handles.push(tokio::spawn(async move { store.insert(&task).await.is_ok() }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_push_candidates_include_unlinked_failures() {
        let store = InMemoryStore::new();
        let mut linked = EntityLink::new(1, 1, now());
        linked.external_id = Some("EXT-1".into());
        linked.status = LinkStatus::Synced;
        let mut failed = EntityLink::new(2, 1, now());
        failed.mark_error("rejected", now());
        let mut orphan = EntityLink::new(3, 1, now());
        orphan.status = LinkStatus::Synced;
        for link in [&linked, &failed, &orphan, &EntityLink::new(4, 1, now())] {
            LinkRepository::save(&store, link).await.unwrap();
        }

        let candidates = store.list_push_candidates(1, None, 10).await.unwrap();
        assert_eq!(
            candidates.iter().map(|l| l.entity_id).collect::<Vec<_>>(),
            vec![1, 2, 4]
        );
        assert_eq!(store.count_push_candidates(1).await.unwrap(), 3);
        assert_eq!(store.count_linked(1).await.unwrap(), 1);

        let after = store.list_push_candidates(1, Some(2), 10).await.unwrap();
        assert_eq!(after.iter().map(|l| l.entity_id).collect::<Vec<_>>(), vec![4]);
    }
}
