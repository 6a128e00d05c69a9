//! Shared fixtures for the synchronization integration tests.
//!
//! [`ScriptedAdapter`] plays the external system: it keeps an in-memory
//! remote table, counts calls and fails or panics on request. [`Harness`]
//! wires it to the in-memory store, the in-memory catalog and a
//! [`ManualClock`] so retry backoff and rate limiting are observable without
//! real sleeps.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use erp_sync_core::adapter::{
    AdapterError, AdapterRegistry, AdapterResult, ChangeMarkers, ErpAdapter, HealthReport,
    PageRequest, PullOutcome, PullTarget, PushOutcome, PushRequest, SubItemOutcome, UpstreamPage,
};
use erp_sync_core::catalog::InMemoryCatalog;
use erp_sync_core::clock::{Clock, ManualClock};
use erp_sync_core::config::SyncConfig;
use erp_sync_core::models::{
    BatchReport, CatalogEntity, Connection, ConnectionId, EntityId, EntityLink, ErpType, PullMode,
    SyncTask, TaskId, TaskKind, TaskStatusView, UpstreamRecord,
};
use erp_sync_core::orchestration::{FixedMemoryProbe, SyncContext, TaskDispatcher, TaskExecutor};
use erp_sync_core::repository::{InMemoryStore, SyncStore};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

/// Production defaults without pacing between external calls
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.batch.inter_item_delay_ms = 0;
    config
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub sku: String,
    pub data: Map<String, Value>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct AdapterState {
    /// Upstream records keyed by external id
    pub remote: BTreeMap<String, RemoteRecord>,
    /// Consumed front to back, one per push call
    pub push_errors: VecDeque<AdapterError>,
    /// Pushes of these entities are always refused
    pub rejected_entities: HashSet<EntityId>,
    pub panic_on_push: bool,
    pub push_delay: Option<Duration>,
    pub modified_count: u64,
    pub count_error: Option<AdapterError>,
    pub stock_error: Option<AdapterError>,
    pub health_latency_ms: u64,

    pub push_calls: u32,
    pub pull_calls: u32,
    pub list_calls: u32,
    pub marker_calls: u32,
    pub count_calls: u32,
    pub stock_calls: u32,
    /// External id handed to each push, in call order
    pub pushed_external_ids: Vec<Option<String>>,
    pub count_windows: Vec<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ScriptedAdapter {
    erp_type: ErpType,
    clock: Arc<ManualClock>,
    state: Mutex<AdapterState>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedAdapter {
    pub fn new(erp_type: ErpType, clock: Arc<ManualClock>) -> Self {
        Self {
            erp_type,
            clock,
            state: Mutex::new(AdapterState {
                health_latency_ms: 42,
                ..AdapterState::default()
            }),
            gate: None,
        }
    }

    /// Pushes block until a permit is added to the returned semaphore
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut AdapterState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn push_calls(&self) -> u32 {
        self.state.lock().push_calls
    }

    pub fn pull_calls(&self) -> u32 {
        self.state.lock().pull_calls
    }

    pub fn remote_len(&self) -> usize {
        self.state.lock().remote.len()
    }

    /// Add an upstream-only record
    pub fn seed_remote(&self, external_id: &str, sku: &str, data: Value, modified_at: DateTime<Utc>) {
        let data = data.as_object().cloned().unwrap_or_default();
        self.state.lock().remote.insert(
            external_id.to_string(),
            RemoteRecord {
                sku: sku.to_string(),
                data,
                modified_at: Some(modified_at),
            },
        );
    }

    /// Simulate an edit made directly in the external system
    pub fn edit_remote(&self, external_id: &str, field: &str, value: Value, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(record) = state.remote.get_mut(external_id) {
            record.data.insert(field.to_string(), value);
            record.modified_at = Some(at);
        }
    }
}

#[async_trait]
impl ErpAdapter for ScriptedAdapter {
    fn erp_type(&self) -> ErpType {
        self.erp_type
    }

    async fn push_entity(
        &self,
        _connection: &Connection,
        request: &PushRequest<'_>,
    ) -> AdapterResult<PushOutcome> {
        let (scripted_error, delay, panic) = {
            let mut state = self.state.lock();
            state.push_calls += 1;
            state
                .pushed_external_ids
                .push(request.external_id.map(str::to_string));
            let error = if state.rejected_entities.contains(&request.entity.entity_id) {
                Some(AdapterError::Validation(format!(
                    "{} rejected by remote",
                    request.entity.sku
                )))
            } else {
                state.push_errors.pop_front()
            };
            (error, state.push_delay, state.panic_on_push)
        };

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if panic {
            panic!("remote client exploded");
        }
        if let Some(error) = scripted_error {
            return Err(error);
        }

        let external_id = request
            .external_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("EXT-{}", request.entity.entity_id));
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state
            .remote
            .entry(external_id.clone())
            .or_insert_with(|| RemoteRecord {
                sku: request.entity.sku.clone(),
                data: Map::new(),
                modified_at: None,
            });
        for (name, value) in request.payload {
            record.data.insert(name.clone(), value.clone());
        }
        record.modified_at = Some(now);

        Ok(PushOutcome {
            external_id: Some(external_id),
            message: "stored".to_string(),
            updated_fields: request.payload.keys().cloned().collect(),
            rows_affected: Some(1),
        })
    }

    async fn pull_entity(
        &self,
        _connection: &Connection,
        target: &PullTarget,
    ) -> AdapterResult<PullOutcome> {
        let mut state = self.state.lock();
        state.pull_calls += 1;
        let found = match &target.external_id {
            Some(external_id) => state
                .remote
                .get(external_id)
                .map(|record| (external_id.clone(), record.clone())),
            None => state
                .remote
                .iter()
                .find(|(_, record)| Some(&record.sku) == target.sku.as_ref())
                .map(|(external_id, record)| (external_id.clone(), record.clone())),
        };
        let (external_id, record) = found.ok_or_else(|| {
            AdapterError::NotFound(format!("entity {} not found upstream", target.entity_id))
        })?;
        Ok(PullOutcome {
            external_id,
            data: record.data,
            modified_at: record.modified_at,
            message: "fetched".to_string(),
        })
    }

    async fn pull_all(
        &self,
        _connection: &Connection,
        request: &PageRequest,
    ) -> AdapterResult<UpstreamPage> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        let matching: Vec<UpstreamRecord> = state
            .remote
            .iter()
            .filter(|(_, record)| match (request.mode, request.since) {
                (PullMode::Incremental, Some(since)) => {
                    record.modified_at.map_or(true, |at| at > since)
                }
                _ => true,
            })
            .map(|(external_id, record)| UpstreamRecord {
                external_id: external_id.clone(),
                sku: Some(record.sku.clone()),
                data: record.data.clone(),
                modified_at: record.modified_at,
            })
            .collect();

        let offset: usize = request
            .cursor
            .as_deref()
            .and_then(|cursor| cursor.parse().ok())
            .unwrap_or(0);
        let end = (offset + request.page_size).min(matching.len());
        let records = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < matching.len()).then(|| end.to_string());
        Ok(UpstreamPage {
            records,
            next_cursor,
        })
    }

    async fn fetch_change_markers(
        &self,
        _connection: &Connection,
        external_ids: &[String],
    ) -> AdapterResult<ChangeMarkers> {
        let mut state = self.state.lock();
        state.marker_calls += 1;
        Ok(external_ids
            .iter()
            .filter_map(|id| state.remote.get(id).map(|record| (id.clone(), record.modified_at)))
            .collect())
    }

    async fn count_modified_since(
        &self,
        _connection: &Connection,
        since: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let mut state = self.state.lock();
        state.count_calls += 1;
        state.count_windows.push(since);
        match state.count_error.clone() {
            Some(error) => Err(error),
            None => Ok(state.modified_count),
        }
    }

    async fn sync_stock(
        &self,
        _connection: &Connection,
        _entity: &CatalogEntity,
        _external_id: Option<&str>,
    ) -> AdapterResult<SubItemOutcome> {
        let mut state = self.state.lock();
        state.stock_calls += 1;
        match state.stock_error.clone() {
            Some(error) => Err(error),
            None => Ok(SubItemOutcome {
                message: "stock updated".to_string(),
            }),
        }
    }

    async fn health_check(&self, _connection: &Connection) -> AdapterResult<HealthReport> {
        let latency_ms = self.state.lock().health_latency_ms;
        Ok(HealthReport {
            latency_ms,
            detail: "pong".to_string(),
        })
    }
}

pub struct Harness {
    pub config: SyncConfig,
    pub clock: Arc<ManualClock>,
    pub store: SyncStore,
    /// The store's backing rows, for inspection
    pub rows: Arc<InMemoryStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub adapters: Arc<AdapterRegistry>,
    pub adapter: Arc<ScriptedAdapter>,
    pub memory: Arc<FixedMemoryProbe>,
    pub executor: Arc<TaskExecutor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let adapter = ScriptedAdapter::new(ErpType::Custom, Arc::clone(&clock));
        Self::assemble(config, clock, adapter)
    }

    /// Harness whose adapter holds every push until the gate opens
    pub fn gated(config: SyncConfig) -> (Self, Arc<Semaphore>) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let (adapter, gate) = ScriptedAdapter::new(ErpType::Custom, Arc::clone(&clock)).gated();
        (Self::assemble(config, clock, adapter), gate)
    }

    fn assemble(config: SyncConfig, clock: Arc<ManualClock>, adapter: ScriptedAdapter) -> Self {
        let rows = Arc::new(InMemoryStore::new());
        let store = SyncStore::new(rows.clone(), rows.clone(), rows.clone());
        let catalog = Arc::new(InMemoryCatalog::new());
        let adapter = Arc::new(adapter);
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(adapter.clone());
        let memory = Arc::new(FixedMemoryProbe::new(64));

        let context = SyncContext::new(store.clone(), catalog.clone(), clock.clone());
        let executor = Arc::new(TaskExecutor::with_memory_probe(
            context,
            Arc::clone(&adapters),
            &config,
            memory.clone(),
        ));

        Self {
            config,
            clock,
            store,
            rows,
            catalog,
            adapters,
            adapter,
            memory,
            executor,
        }
    }

    /// Rebuild the executor, e.g. to swap the retry policy or timeouts
    pub fn customize_executor(mut self, f: impl FnOnce(TaskExecutor) -> TaskExecutor) -> Self {
        let context = SyncContext::new(
            self.store.clone(),
            self.catalog.clone(),
            self.clock.clone(),
        );
        let base = TaskExecutor::with_memory_probe(
            context,
            Arc::clone(&self.adapters),
            &self.config,
            self.memory.clone(),
        );
        self.executor = Arc::new(f(base));
        self
    }

    pub async fn add_connection(&self, connection_id: ConnectionId) -> Connection {
        let connection = Connection::new(
            connection_id,
            format!("erp-{connection_id}"),
            ErpType::Custom,
            self.clock.now(),
        );
        self.save_connection(&connection).await;
        connection
    }

    pub async fn save_connection(&self, connection: &Connection) {
        self.store
            .connections
            .upsert(connection)
            .await
            .expect("connection upsert");
    }

    pub async fn connection(&self, connection_id: ConnectionId) -> Connection {
        self.store
            .connections
            .get(connection_id)
            .await
            .expect("connection lookup")
            .expect("connection exists")
    }

    /// Entities 1..=count with a name and a price, last edited at the start time
    pub fn seed_entities(&self, count: i64) -> Vec<EntityId> {
        (1..=count)
            .map(|id| {
                self.catalog.insert(
                    CatalogEntity::new(id, format!("SKU-{id}"), start_time())
                        .with_field("name", json!(format!("Item {id}")))
                        .with_field("price", json!(id * 10)),
                );
                id
            })
            .collect()
    }

    pub async fn link(&self, entity_id: EntityId, connection_id: ConnectionId) -> Option<EntityLink> {
        self.store
            .links
            .find(entity_id, connection_id)
            .await
            .expect("link lookup")
    }

    pub fn new_task(
        &self,
        kind: TaskKind,
        connection_id: ConnectionId,
        entity_id: Option<EntityId>,
    ) -> SyncTask {
        SyncTask::new(kind, connection_id, entity_id, self.clock.now())
    }

    /// Persist a task and execute it to a terminal state
    pub async fn run(&self, task: SyncTask) -> SyncTask {
        let task_id = task.task_id;
        self.store.tasks.insert(&task).await.expect("task insert");
        self.executor.execute(task_id).await.expect("task execution")
    }

    pub async fn task(&self, task_id: TaskId) -> SyncTask {
        self.store
            .tasks
            .get(task_id)
            .await
            .expect("task lookup")
            .expect("task exists")
    }
}

pub fn batch_report(task: &SyncTask) -> BatchReport {
    serde_json::from_value(task.result_summary.clone().expect("result summary"))
        .expect("batch report")
}

/// Poll until the task is terminal and its idempotency key is released
pub async fn wait_for_terminal(dispatcher: &TaskDispatcher, task_id: TaskId) -> TaskStatusView {
    for _ in 0..500 {
        let view = dispatcher.get_task(task_id).await.expect("task status");
        let released = dispatcher
            .executor()
            .idempotency()
            .in_flight_count()
            == 0;
        if view.status.is_terminal() && released {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not finish in time");
}
