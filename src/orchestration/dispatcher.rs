//! # Task Dispatcher
//!
//! The enqueue and status surface, plus the worker pool that drains it.
//!
//! ## Queues
//!
//! Two bounded queues: `high` for single-entity tasks on important entities,
//! `default` for everything else. Workers always take from `high` first.
//! Concurrency is bounded by a semaphore of `executor.max_concurrent_tasks`
//! permits, acquired before a task is dequeued.
//!
//! ## Deduplication
//!
//! The idempotency key is claimed at enqueue time and travels with the
//! queued task into the worker, so a key stays in flight from enqueue until
//! the task is terminal. A second enqueue for the same key either attaches to
//! the in-flight task or is rejected with `DUPLICATE_IN_FLIGHT`, depending on
//! `executor.duplicate_policy`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::idempotency::{IdempotencyGuard, IdempotencyKey};
use super::task_executor::TaskExecutor;
use crate::config::{DuplicatePolicy, ExecutorConfig};
use crate::constants::operations;
use crate::error::{Result, SyncError};
use crate::logging::log_task_operation;
use crate::models::{
    ConnectionId, EntityId, SyncOptions, SyncTask, TaskFilters, TaskId, TaskKind, TaskQueue,
    TaskStatusView,
};

/// Everything needed to create a task
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub kind: TaskKind,
    pub connection_id: ConnectionId,
    pub entity_id: Option<EntityId>,
    pub filters: TaskFilters,
    pub options: SyncOptions,
    /// Acting user; `None` for system-triggered work
    pub triggered_by: Option<String>,
    /// Upstream modification count that triggered this task
    pub observed_count: Option<u64>,
    /// Overrides queue selection
    pub queue: Option<TaskQueue>,
}

impl EnqueueRequest {
    pub fn new(kind: TaskKind, connection_id: ConnectionId) -> Self {
        Self {
            kind,
            connection_id,
            entity_id: None,
            filters: TaskFilters::default(),
            options: SyncOptions::default(),
            triggered_by: None,
            observed_count: None,
            queue: None,
        }
    }

    pub fn for_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn with_filters(mut self, filters: TaskFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn triggered_by(mut self, actor: impl Into<String>) -> Self {
        self.triggered_by = Some(actor.into());
        self
    }

    pub fn observed(mut self, count: u64) -> Self {
        self.observed_count = Some(count);
        self
    }

    pub fn on_queue(mut self, queue: TaskQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.kind.requires_entity() && self.entity_id.is_none() {
            return Err(SyncError::Validation(format!(
                "{} requires an entity",
                self.kind
            )));
        }
        self.options.validate().map_err(SyncError::Validation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDisposition {
    /// A new task was created and queued
    Enqueued,
    /// An in-flight task with the same key was returned instead
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub task_id: TaskId,
    pub disposition: EnqueueDisposition,
    pub queue: TaskQueue,
}

/// Anything that accepts new tasks
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn submit(&self, request: EnqueueRequest) -> Result<EnqueueReceipt>;
}

struct QueuedTask {
    task_id: TaskId,
    guard: IdempotencyGuard,
}

pub struct TaskDispatcher {
    executor: Arc<TaskExecutor>,
    duplicate_policy: DuplicatePolicy,
    high: mpsc::Sender<QueuedTask>,
    default: mpsc::Sender<QueuedTask>,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("duplicate_policy", &self.duplicate_policy)
            .field("in_flight", &self.executor.idempotency().in_flight_count())
            .finish()
    }
}

/// Owns the worker loop; dropping it stops dequeuing without waiting
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop dequeuing and wait for running tasks to finish.
    ///
    /// Tasks still queued stay `pending` in the store and their keys are released.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(join_error) = self.join.await {
            error!(error = %join_error, "Dispatcher loop terminated abnormally");
        }
        info!("🛑 Task dispatcher stopped");
    }
}

impl TaskDispatcher {
    /// Start the worker loop on the current runtime
    pub fn start(executor: Arc<TaskExecutor>, config: &ExecutorConfig) -> (Arc<Self>, DispatcherHandle) {
        let (high_tx, high_rx) = mpsc::channel(config.queue_capacity);
        let (default_tx, default_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Arc::new(Self {
            executor: Arc::clone(&executor),
            duplicate_policy: config.duplicate_policy,
            high: high_tx,
            default: default_tx,
        });

        let join = tokio::spawn(run_workers(
            executor,
            high_rx,
            default_rx,
            shutdown_rx,
            config.max_concurrent_tasks,
        ));

        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            queue_capacity = config.queue_capacity,
            duplicate_policy = ?config.duplicate_policy,
            "🚀 Task dispatcher started"
        );

        (
            dispatcher,
            DispatcherHandle {
                shutdown: shutdown_tx,
                join,
            },
        )
    }

    /// Create, persist and queue a task; or attach to the in-flight duplicate
    #[instrument(skip(self, request), fields(kind = %request.kind, connection_id = request.connection_id))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt> {
        request.validate()?;
        let context = self.executor.context();
        let queue = match request.queue {
            Some(queue) => queue,
            None => self.select_queue(&request).await?,
        };

        let now = context.clock.now();
        let mut task = SyncTask::new(request.kind, request.connection_id, request.entity_id, now);
        task.queue = queue;
        task.triggered_by = request.triggered_by;
        task.metadata.filters = request.filters;
        task.metadata.options = request.options;
        task.metadata.observed_count = request.observed_count;

        let key = IdempotencyKey::for_task(&task);
        let guard = match self.executor.idempotency().try_acquire(key, task.task_id) {
            Ok(guard) => guard,
            Err(existing) => return self.on_duplicate(key, existing).await,
        };

        context.store.tasks.insert(&task).await?;
        let sender = match queue {
            TaskQueue::High => &self.high,
            TaskQueue::Default => &self.default,
        };
        let queued = QueuedTask {
            task_id: task.task_id,
            guard,
        };
        if sender.send(queued).await.is_err() {
            // The persisted row must not stay pending with no worker to run it
            let error = SyncError::DispatcherClosed("worker loop is not running".to_string());
            task.fail(error.to_string(), None, None, error.kind(), context.clock.now())?;
            context.store.tasks.save(&task).await?;
            warn!(task_id = %task.task_id, "Task failed: dispatcher closed before it was queued");
            return Err(error);
        }

        log_task_operation(
            operations::TASK_ENQUEUED,
            task.task_id,
            task.connection_id,
            task.kind.as_str(),
            task.status.as_str(),
            Some(queue.as_str()),
        );
        Ok(EnqueueReceipt {
            task_id: task.task_id,
            disposition: EnqueueDisposition::Enqueued,
            queue,
        })
    }

    async fn on_duplicate(&self, key: IdempotencyKey, existing: TaskId) -> Result<EnqueueReceipt> {
        match self.duplicate_policy {
            DuplicatePolicy::Reject => {
                warn!(key = %key, existing = %existing, "Duplicate enqueue rejected");
                Err(SyncError::DuplicateInFlight {
                    key: key.to_string(),
                    existing,
                })
            }
            DuplicatePolicy::Attach => {
                let queue = self
                    .executor
                    .context()
                    .store
                    .tasks
                    .get(existing)
                    .await?
                    .map(|task| task.queue)
                    .unwrap_or_default();
                log_task_operation(
                    operations::TASK_ATTACHED,
                    existing,
                    key.connection_id,
                    key.kind.as_str(),
                    "in_flight",
                    Some(&key.to_string()),
                );
                Ok(EnqueueReceipt {
                    task_id: existing,
                    disposition: EnqueueDisposition::Attached,
                    queue,
                })
            }
        }
    }

    async fn select_queue(&self, request: &EnqueueRequest) -> Result<TaskQueue> {
        let Some(entity_id) = request.entity_id.filter(|_| request.kind.requires_entity()) else {
            return Ok(TaskQueue::Default);
        };
        let important = self
            .executor
            .context()
            .catalog
            .load_entity(entity_id)
            .await?
            .is_some_and(|entity| entity.important);
        Ok(if important {
            TaskQueue::High
        } else {
            TaskQueue::Default
        })
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<TaskStatusView> {
        self.executor
            .context()
            .store
            .tasks
            .get(task_id)
            .await?
            .map(|task| task.status_view())
            .ok_or(SyncError::TaskNotFound(task_id))
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }
}

#[async_trait]
impl TaskSink for TaskDispatcher {
    async fn submit(&self, request: EnqueueRequest) -> Result<EnqueueReceipt> {
        self.enqueue(request).await
    }
}

async fn run_workers(
    executor: Arc<TaskExecutor>,
    mut high: mpsc::Receiver<QueuedTask>,
    mut default: mpsc::Receiver<QueuedTask>,
    mut shutdown: watch::Receiver<bool>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(job) = high.recv() => job,
            Some(job) = default.recv() => job,
            else => break,
        };

        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            let _permit = permit;
            let task_id = job.task_id;
            match executor.execute_acquired(task_id, job.guard).await {
                Ok(task) => debug!(task_id = %task_id, status = %task.status, "Worker finished task"),
                Err(error) => error!(task_id = %task_id, error = %error, "Worker could not execute task"),
            }
        });
    }

    if let Ok(max) = u32::try_from(max_concurrent) {
        let _ = permits.acquire_many(max).await;
    }
}
