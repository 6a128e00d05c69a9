//! # Task Executor
//!
//! Runs one task to a terminal state.
//!
//! ## Attempt Lifecycle
//!
//! 1. Load the connection and resolve its adapter. A missing or inactive
//!    connection, an unsupported ERP type and invalid options or direction
//!    fail the task permanently, without touching connection health.
//! 2. `start` the task (once; retries keep it `running`) and persist it.
//! 3. Dispatch to the operation the task kind implies, under the kind's
//!    wall-clock budget. Adapter panics surface as `INTERNAL` errors.
//! 4. Fold the call into connection health and statistics, update links,
//!    and `complete` / `complete_with_errors` / `fail` the task.
//!
//! Failures of a retryable kind (`CONNECTION_ERROR`, `TIMEOUT`, `INTERNAL`)
//! sleep through the injected clock and try again until the retry policy
//! gives up. Only the final attempt counts towards the connection's failed
//! sync statistic; every attempt updates health.
//!
//! The idempotency key is held for the whole execution, backoff included.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::batch_synchronizer::BatchSynchronizer;
use super::entity_sync::SyncContext;
use super::idempotency::{IdempotencyGuard, IdempotencyKey, IdempotencyRegistry};
use super::memory::{MemoryProbe, ProcessMemoryProbe};
use super::retry::{RetryDecision, RetryPolicy};
use crate::adapter::{call_guarded, AdapterRegistry, ErpAdapter};
use crate::config::{SyncConfig, TimeoutConfig};
use crate::constants::operations;
use crate::error::{Result, SyncError};
use crate::logging::{log_connection_operation, log_task_operation};
use crate::models::{
    CallOutcome, CallReport, Connection, HealthPolicy, ItemFailure, SyncTask, TaskId, TaskKind,
    TimeoutClass,
};
use crate::repository::RepositoryError;
use crate::state_machine::TaskState;

/// Wall-clock budget per timeout class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTimeouts {
    pub detection: Duration,
    pub single_entity: Duration,
    pub bulk_push: Duration,
    pub bulk_pull: Duration,
}

impl From<&TimeoutConfig> for TaskTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            detection: config.detection_timeout(),
            single_entity: config.single_entity_timeout(),
            bulk_push: config.bulk_push_timeout(),
            bulk_pull: config.bulk_pull_timeout(),
        }
    }
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl TaskTimeouts {
    pub fn budget(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Detection => self.detection,
            TimeoutClass::SingleEntity => self.single_entity,
            TimeoutClass::BulkPush => self.bulk_push,
            TimeoutClass::BulkPull => self.bulk_pull,
        }
    }
}

/// Result of a successful dispatch, before it is folded into task and connection
struct DispatchSuccess {
    result: Value,
    failures: Vec<ItemFailure>,
    payload_bytes: Option<u64>,
    records: u64,
    /// Adapter-reported latency, preferred over the measured one
    latency_ms: Option<u64>,
}

enum AttemptResult {
    Finished,
    Retry(Duration),
}

pub struct TaskExecutor {
    context: SyncContext,
    adapters: Arc<AdapterRegistry>,
    idempotency: IdempotencyRegistry,
    retry_policy: RetryPolicy,
    timeouts: TaskTimeouts,
    health_policy: HealthPolicy,
    fallback_lookback: chrono::Duration,
    batch: BatchSynchronizer,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("adapters", &self.adapters)
            .field("retry_policy", &self.retry_policy)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl TaskExecutor {
    pub fn new(context: SyncContext, adapters: Arc<AdapterRegistry>, config: &SyncConfig) -> Self {
        Self::with_memory_probe(context, adapters, config, Arc::new(ProcessMemoryProbe::new()))
    }

    pub fn with_memory_probe(
        context: SyncContext,
        adapters: Arc<AdapterRegistry>,
        config: &SyncConfig,
        memory_probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            batch: BatchSynchronizer::new(context.clone(), memory_probe, config.batch.clone()),
            context,
            adapters,
            idempotency: IdempotencyRegistry::new(),
            retry_policy: RetryPolicy::from_config(&config.retry),
            timeouts: TaskTimeouts::from(&config.timeouts),
            health_policy: HealthPolicy {
                degraded_latency_ms: config.health.degraded_latency_ms,
            },
            fallback_lookback: config.change_detection.fallback_lookback(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TaskTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub fn idempotency(&self) -> &IdempotencyRegistry {
        &self.idempotency
    }

    pub fn health_policy(&self) -> &HealthPolicy {
        &self.health_policy
    }

    /// Execute a persisted task, claiming its idempotency key first.
    ///
    /// If another task holds the key, this task fails with `DUPLICATE_IN_FLIGHT`
    /// and the running one is left alone.
    pub async fn execute(&self, task_id: TaskId) -> Result<SyncTask> {
        let mut task = self.load(task_id).await?;
        let key = IdempotencyKey::for_task(&task);

        match self.idempotency.try_acquire(key, task_id) {
            Ok(guard) => self.execute_acquired(task_id, guard).await,
            Err(holder) if holder == task_id => Err(SyncError::DuplicateInFlight {
                key: key.to_string(),
                existing: holder,
            }),
            Err(holder) => {
                let error = SyncError::DuplicateInFlight {
                    key: key.to_string(),
                    existing: holder,
                };
                warn!(task_id = %task_id, existing = %holder, key = %key, "Duplicate task refused");
                if !task.status.is_terminal() {
                    task.fail(error.to_string(), None, None, error.kind(), self.context.clock.now())?;
                    self.context.store.tasks.save(&task).await?;
                }
                Ok(task)
            }
        }
    }

    /// Execute a task whose idempotency key the caller already holds
    #[instrument(skip(self, guard), fields(task_id = %task_id, key = %guard.key()))]
    pub async fn execute_acquired(
        &self,
        task_id: TaskId,
        guard: IdempotencyGuard,
    ) -> Result<SyncTask> {
        let _guard = guard;
        let mut task = self.load(task_id).await?;
        if task.status.is_terminal() {
            debug!(status = %task.status, "Task already finished");
            return Ok(task);
        }

        loop {
            task.metadata.attempts += 1;
            let attempt = task.metadata.attempts;
            match self.run_attempt(&mut task, attempt).await? {
                AttemptResult::Finished => return Ok(task),
                AttemptResult::Retry(delay) => self.context.clock.sleep(delay).await,
            }
        }
    }

    async fn load(&self, task_id: TaskId) -> Result<SyncTask> {
        self.context
            .store
            .tasks
            .get(task_id)
            .await?
            .ok_or(SyncError::TaskNotFound(task_id))
    }

    async fn run_attempt(&self, task: &mut SyncTask, attempt: u32) -> Result<AttemptResult> {
        let connection = match self.context.store.connections.get(task.connection_id).await? {
            Some(connection) => connection,
            None => {
                return self
                    .fail_permanently(task, SyncError::ConnectionNotFound(task.connection_id))
                    .await
            }
        };
        if !connection.is_active {
            return self
                .fail_permanently(task, SyncError::ConnectionInactive(connection.connection_id))
                .await;
        }
        let adapter = match self.adapters.resolve(&connection) {
            Ok(adapter) => adapter,
            Err(error) => return self.fail_permanently(task, error).await,
        };
        if let Err(error) = validate(task, &connection) {
            return self.fail_permanently(task, error).await;
        }

        let now = self.context.clock.now();
        if task.status == TaskState::Pending {
            task.start(now)?;
            log_task_operation(
                operations::TASK_STARTED,
                task.task_id,
                task.connection_id,
                task.kind.as_str(),
                task.status.as_str(),
                None,
            );
        }
        task.updated_at = now;
        self.context.store.tasks.save(task).await?;

        let budget = self.timeouts.budget(task.kind.timeout_class());
        let started = Instant::now();
        let result = match tokio::time::timeout(
            budget,
            self.dispatch(task, &connection, adapter.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                budget_ms: budget.as_millis() as u64,
            }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(success) => self.finish_success(task, &connection, success, latency_ms).await,
            Err(error) => {
                self.handle_failure(task, &connection, error, attempt, latency_ms)
                    .await
            }
        }
    }

    async fn dispatch(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
    ) -> Result<DispatchSuccess> {
        match task.kind {
            TaskKind::PushOne => self.push_one(task, connection, adapter).await,
            TaskKind::PullOne => self.pull_one(task, connection, adapter).await,
            TaskKind::PushAll
            | TaskKind::PullAll
            | TaskKind::PullLinked
            | TaskKind::PullIncremental => {
                let report = self.batch.run(task, connection, adapter).await?;
                let result = serde_json::to_value(&report).map_err(RepositoryError::from)?;
                Ok(DispatchSuccess {
                    result,
                    failures: report.errors.clone(),
                    payload_bytes: None,
                    records: report.succeeded,
                    latency_ms: None,
                })
            }
            TaskKind::DetectOnly => {
                let since = connection
                    .last_successful_sync_at
                    .unwrap_or_else(|| self.context.clock.now() - self.fallback_lookback);
                let count =
                    call_guarded(adapter.count_modified_since(connection, since)).await?;
                task.metadata.observed_count = Some(count);
                single_item_progress(task, true)?;
                Ok(DispatchSuccess {
                    result: json!({ "since": since, "count": count }),
                    failures: Vec::new(),
                    payload_bytes: None,
                    records: 0,
                    latency_ms: None,
                })
            }
            TaskKind::HealthCheck => {
                let report = call_guarded(adapter.health_check(connection)).await?;
                single_item_progress(task, true)?;
                Ok(DispatchSuccess {
                    result: json!({ "latency_ms": report.latency_ms, "detail": report.detail }),
                    failures: Vec::new(),
                    payload_bytes: None,
                    records: 0,
                    latency_ms: Some(report.latency_ms),
                })
            }
        }
    }

    async fn push_one(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
    ) -> Result<DispatchSuccess> {
        let entity_id = required_entity(task)?;
        let entity = self
            .context
            .catalog
            .load_entity(entity_id)
            .await?
            .ok_or_else(|| SyncError::Validation(format!("entity {entity_id} not in catalog")))?;
        let options = task.metadata.options.clone();

        let sub_item_count = u64::from(options.sync_stock) + u64::from(options.sync_prices);
        task.set_total_items(1 + sub_item_count)?;

        let pushed = self
            .context
            .push_entity(connection, adapter, &entity, &options)
            .await?;

        let failed = pushed.sub_failures.len() as u64;
        let processed = 1 + pushed.sub_items.len() as u64;
        task.update_progress(processed, processed - failed, failed, None)?;

        Ok(DispatchSuccess {
            result: json!({
                "external_id": pushed.link.external_id,
                "message": pushed.outcome.message,
                "updated_fields": pushed.outcome.updated_fields,
                "rows_affected": pushed.outcome.rows_affected,
                "sub_items": pushed.sub_items,
            }),
            failures: pushed.sub_failures,
            payload_bytes: Some(pushed.payload_bytes),
            records: 1,
            latency_ms: None,
        })
    }

    async fn pull_one(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
    ) -> Result<DispatchSuccess> {
        let entity_id = required_entity(task)?;
        task.set_total_items(1)?;
        let link = self
            .context
            .store
            .links
            .find(entity_id, connection.connection_id)
            .await?;
        let pulled = self
            .context
            .pull_entity(connection, adapter, entity_id, link)
            .await?;
        single_item_progress(task, true)?;

        let payload_bytes = serde_json::to_vec(&pulled.outcome.data)
            .map(|bytes| bytes.len() as u64)
            .ok();
        Ok(DispatchSuccess {
            result: json!({
                "external_id": pulled.outcome.external_id,
                "message": pulled.outcome.message,
                "data": pulled.outcome.data,
                "created": pulled.import.created,
                "changed": pulled.import.changed,
            }),
            failures: Vec::new(),
            payload_bytes,
            records: 1,
            latency_ms: None,
        })
    }

    async fn finish_success(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        success: DispatchSuccess,
        measured_latency_ms: u64,
    ) -> Result<AttemptResult> {
        let now = self.context.clock.now();
        let partial = !success.failures.is_empty() || task.failed_items > 0;
        let outcome = if partial {
            CallOutcome::PartialSuccess
        } else {
            CallOutcome::Success
        };
        let latency_ms = success.latency_ms.unwrap_or(measured_latency_ms);

        let report = if task.kind.is_probe() {
            CallReport::probe(now, outcome, Some(latency_ms))
        } else {
            CallReport {
                latency_ms: Some(latency_ms),
                duration_ms: Some(measured_latency_ms),
                payload_bytes: success.payload_bytes,
                records: success.records,
                ..CallReport::new(now, outcome)
            }
        };
        self.record_call(connection, &report).await?;

        let operation = if partial {
            task.complete_with_errors(success.result, success.failures, now)?;
            operations::TASK_COMPLETED_WITH_ERRORS
        } else {
            task.complete(success.result, now)?;
            operations::TASK_COMPLETED
        };
        self.context.store.tasks.save(task).await?;

        log_task_operation(
            operation,
            task.task_id,
            task.connection_id,
            task.kind.as_str(),
            task.status.as_str(),
            Some(&task.status_message()),
        );
        Ok(AttemptResult::Finished)
    }

    async fn handle_failure(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        error: SyncError,
        attempt: u32,
        latency_ms: u64,
    ) -> Result<AttemptResult> {
        let now = self.context.clock.now();
        let kind = error.kind();
        let message = error.to_string();
        let decision = self.retry_policy.decide(attempt, kind);

        if error.involves_remote() {
            let outcome = match &error {
                SyncError::Adapter(adapter_error) if adapter_error.reached_remote() => {
                    CallOutcome::Rejected(message.clone())
                }
                _ => CallOutcome::Failed(message.clone()),
            };
            let report = if task.kind.is_probe() {
                CallReport::probe(now, outcome, Some(latency_ms))
            } else {
                CallReport {
                    latency_ms: Some(latency_ms),
                    duration_ms: Some(latency_ms),
                    counts_as_sync: decision == RetryDecision::GiveUp,
                    ..CallReport::new(now, outcome)
                }
            };
            self.record_call(connection, &report).await?;
        }

        if matches!(error, SyncError::Timeout { .. }) {
            if let Some(entity_id) = task.entity_id.filter(|_| task.kind.requires_entity()) {
                self.context
                    .record_link_error(entity_id, task.connection_id, &message)
                    .await?;
            }
        }

        match decision {
            RetryDecision::RetryAfter(delay) => {
                task.metadata.last_attempt_error = Some(message.clone());
                task.updated_at = now;
                self.context.store.tasks.save(task).await?;
                warn!(
                    operation = operations::TASK_RETRY_SCHEDULED,
                    task_id = %task.task_id,
                    connection_id = task.connection_id,
                    kind = %task.kind,
                    attempt = attempt,
                    max_attempts = self.retry_policy.max_attempts(),
                    delay_secs = delay.as_secs(),
                    error_kind = %kind,
                    error = %message,
                    "🔁 Attempt failed, retry scheduled"
                );
                Ok(AttemptResult::Retry(delay))
            }
            RetryDecision::GiveUp => {
                let detail = format!(
                    "attempt {attempt} of {} failed with {kind}",
                    self.retry_policy.max_attempts()
                );
                task.metadata.last_attempt_error = Some(message.clone());
                task.fail(message.clone(), Some(detail), None, kind, now)?;
                self.context.store.tasks.save(task).await?;
                error!(
                    operation = operations::TASK_FAILED,
                    task_id = %task.task_id,
                    connection_id = task.connection_id,
                    kind = %task.kind,
                    attempt = attempt,
                    error_kind = %kind,
                    error = %message,
                    "❌ Task failed"
                );
                Ok(AttemptResult::Finished)
            }
        }
    }

    /// Fail a task before any external call; connection health is left alone
    async fn fail_permanently(&self, task: &mut SyncTask, error: SyncError) -> Result<AttemptResult> {
        let now = self.context.clock.now();
        let kind = error.kind();
        task.fail(error.to_string(), None, None, kind, now)?;
        self.context.store.tasks.save(task).await?;
        error!(
            operation = operations::TASK_FAILED,
            task_id = %task.task_id,
            connection_id = task.connection_id,
            kind = %task.kind,
            error_kind = %kind,
            error = %error,
            "❌ Task rejected before dispatch"
        );
        Ok(AttemptResult::Finished)
    }

    async fn record_call(&self, connection: &Connection, report: &CallReport) -> Result<()> {
        let updated = self
            .context
            .store
            .connections
            .record_call(connection.connection_id, report, &self.health_policy)
            .await?;
        if updated.health != connection.health || updated.is_active != connection.is_active {
            log_connection_operation(operations::CONNECTION_HEALTH_UPDATED, &updated);
        }
        if connection.is_active && !updated.is_active {
            info!(
                connection_id = updated.connection_id,
                consecutive_failures = updated.consecutive_failures,
                "🔌 Connection auto-disabled after repeated failures"
            );
        }
        Ok(())
    }
}

fn required_entity(task: &SyncTask) -> Result<crate::models::EntityId> {
    task.entity_id
        .ok_or_else(|| SyncError::Validation(format!("{} requires an entity", task.kind)))
}

fn single_item_progress(task: &mut SyncTask, succeeded: bool) -> Result<()> {
    if task.total_items == 0 {
        task.set_total_items(1)?;
    }
    let succeeded = u64::from(succeeded);
    task.update_progress(1, succeeded, 1 - succeeded, None)?;
    Ok(())
}

/// Checks that need no external call
fn validate(task: &SyncTask, connection: &Connection) -> Result<()> {
    task.metadata
        .options
        .validate()
        .map_err(SyncError::Validation)?;
    if task.kind.requires_entity() && task.entity_id.is_none() {
        return Err(SyncError::Validation(format!(
            "{} requires an entity",
            task.kind
        )));
    }
    if task.kind.is_push() && !connection.sync_mode.allows_push() {
        return Err(SyncError::Validation(format!(
            "connection {} does not accept pushes (mode {})",
            connection.connection_id, connection.sync_mode
        )));
    }
    if task.kind.is_pull() && !connection.sync_mode.allows_pull() {
        return Err(SyncError::Validation(format!(
            "connection {} does not allow pulls (mode {})",
            connection.connection_id, connection.sync_mode
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErpType, SyncMode};
    use chrono::Utc;

    #[test]
    fn test_budget_per_class() {
        let timeouts = TaskTimeouts::default();
        assert_eq!(timeouts.budget(TimeoutClass::Detection), Duration::from_secs(60));
        assert_eq!(timeouts.budget(TimeoutClass::SingleEntity), Duration::from_secs(300));
        assert_eq!(timeouts.budget(TimeoutClass::BulkPush), Duration::from_secs(600));
        assert_eq!(timeouts.budget(TimeoutClass::BulkPull), Duration::from_secs(3600));
    }

    #[test]
    fn test_direction_validation() {
        let now = Utc::now();
        let pull_only =
            Connection::new(1, "ledger", ErpType::Dynamics, now).with_sync_mode(SyncMode::PullOnly);

        let push = SyncTask::new(TaskKind::PushOne, 1, Some(3), now);
        assert!(matches!(
            validate(&push, &pull_only),
            Err(SyncError::Validation(_))
        ));

        let pull = SyncTask::new(TaskKind::PullLinked, 1, None, now);
        assert!(validate(&pull, &pull_only).is_ok());

        let missing_entity = SyncTask::new(TaskKind::PullOne, 1, None, now);
        assert!(validate(&missing_entity, &pull_only).is_err());

        let probe = SyncTask::new(TaskKind::HealthCheck, 1, None, now);
        let disabled = Connection::new(2, "off", ErpType::Custom, now)
            .with_sync_mode(SyncMode::Disabled);
        assert!(validate(&probe, &disabled).is_ok());
    }
}
