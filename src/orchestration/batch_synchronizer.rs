//! # Batch Synchronizer
//!
//! Chunked, rate-limited bulk runs under a single task.
//!
//! ## Runs
//!
//! - **push_all**: entities linked to the connection plus links still waiting
//!   for a first successful push (default), or the whole catalog
//!   (`mode = full`). Entities whose link is `synced`, has no pending fields
//!   and was synced after the last local edit are skipped.
//! - **pull_linked**: the fast path. Change markers for a chunk of linked
//!   external ids are fetched in one call; only records modified after the
//!   link's `last_pull_at` are pulled. A record without a marker is treated
//!   as changed, and an id missing from the answer counts as `not_found`.
//! - **pull_upstream**: paged upstream listing (`full` or `incremental`),
//!   capped by the task's limit. Every record is written to the catalog.
//!
//! ## Bounds
//!
//! After each chunk the task's counters, checkpoint and partial report are
//! persisted, so a retried or resumed run continues where it stopped.
//! Consecutive external calls are separated by `batch.inter_item_delay_ms`
//! through the injected clock. Resident memory is checked after every chunk:
//! the first time it is above the soft limit a warning is recorded, above the
//! hard limit the run stops with `MEMORY_LIMIT`.
//!
//! Item-level failures never abort a run; the first `max_reported_errors`
//! are kept on the report. Storage failures and failures of the listing or
//! marker calls themselves abort the run and go through the retry policy.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::entity_sync::{PulledEntity, SyncContext};
use super::memory::{MemoryLimits, MemoryPressure, MemoryProbe};
use crate::adapter::{call_guarded, ErpAdapter, PageRequest};
use crate::config::BatchConfig;
use crate::error::{Result, SyncError};
use crate::logging::log_batch_progress;
use crate::models::{
    BatchReport, CatalogEntity, Checkpoint, Connection, EntityId, EntityLink, ItemFailure,
    PullMode, SyncTask, TaskKind,
};

pub struct BatchSynchronizer {
    context: SyncContext,
    memory_probe: Arc<dyn MemoryProbe>,
    config: BatchConfig,
}

struct RunState {
    report: BatchReport,
    checkpoint: Checkpoint,
    external_calls: u64,
    chunks: usize,
    started_at: DateTime<Utc>,
    processed_at_start: u64,
    memory_warned: bool,
}

enum PushCandidate {
    Entity(CatalogEntity, Option<EntityLink>),
    Missing(EntityId),
}

fn is_unchanged(marker: Option<DateTime<Utc>>, last_pull_at: Option<DateTime<Utc>>) -> bool {
    matches!((marker, last_pull_at), (Some(marker), Some(pulled)) if marker <= pulled)
}

fn is_push_current(entity: &CatalogEntity, link: &EntityLink) -> bool {
    link.status == crate::models::LinkStatus::Synced
        && link.external_id.is_some()
        && link.pending_fields.is_empty()
        && link
            .last_sync_at
            .is_some_and(|synced| synced >= entity.updated_at)
}

fn item_failure(
    entity_id: Option<EntityId>,
    external_id: Option<String>,
    error: &SyncError,
) -> ItemFailure {
    ItemFailure {
        entity_id,
        external_id,
        kind: error.kind(),
        message: error.to_string(),
    }
}

fn tally_pull(report: &mut BatchReport, pulled: &PulledEntity) {
    tally_import(report, pulled.import.created, pulled.import.changed);
}

fn tally_import(report: &mut BatchReport, created: bool, changed: bool) {
    if created {
        report.imported += 1;
        report.record_success();
    } else if changed {
        report.updated += 1;
        report.record_success();
    } else {
        report.record_skipped();
    }
}

impl BatchSynchronizer {
    pub fn new(context: SyncContext, memory_probe: Arc<dyn MemoryProbe>, config: BatchConfig) -> Self {
        Self {
            context,
            memory_probe,
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run the bulk operation implied by the task kind and pull mode
    pub async fn run(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
    ) -> Result<BatchReport> {
        match (task.kind, task.metadata.filters.mode) {
            (TaskKind::PushAll, _) => self.push_all(task, connection, adapter).await,
            (TaskKind::PullLinked, _) | (TaskKind::PullAll, Some(PullMode::Linked)) => {
                self.pull_linked(task, connection, adapter).await
            }
            (TaskKind::PullAll | TaskKind::PullIncremental, _) => {
                self.pull_upstream(task, connection, adapter).await
            }
            (kind, _) => Err(SyncError::Validation(format!(
                "{kind} is not a bulk task kind"
            ))),
        }
    }

    fn resume_state(&self, task: &SyncTask) -> RunState {
        let checkpoint = task
            .metadata
            .checkpoint
            .clone()
            .or_else(|| task.metadata.filters.resume_from.clone())
            .unwrap_or_default();
        let report = task.metadata.partial_report.clone().unwrap_or_default();
        if checkpoint != Checkpoint::default() {
            info!(
                task_id = %task.task_id,
                last_entity_id = ?checkpoint.last_entity_id,
                cursor = ?checkpoint.cursor,
                processed = report.processed,
                "⏩ Resuming bulk run from checkpoint"
            );
        }
        RunState {
            processed_at_start: report.processed,
            report,
            checkpoint,
            external_calls: 0,
            chunks: 0,
            started_at: self.context.clock.now(),
            memory_warned: false,
        }
    }

    async fn begin(&self, task: &mut SyncTask, state: &mut RunState, counted: u64) -> Result<()> {
        state.report.total = state.report.total.max(counted);
        task.set_total_items(state.report.total.max(task.processed_items))?;
        task.updated_at = self.context.clock.now();
        self.context.store.tasks.save(task).await?;
        Ok(())
    }

    /// Space consecutive external calls by the configured delay
    async fn throttle(&self, state: &mut RunState) {
        if state.external_calls > 0 {
            let delay = self.config.inter_item_delay();
            if !delay.is_zero() {
                self.context.clock.sleep(delay).await;
                state.report.rate_limit_wait_ms += delay.as_millis() as u64;
            }
        }
        state.external_calls += 1;
    }

    async fn persist_chunk(&self, task: &mut SyncTask, state: &mut RunState) -> Result<()> {
        let now = self.context.clock.now();
        state.report.total = state.report.total.max(state.report.processed);
        task.set_total_items(state.report.total)?;

        let items_this_run = state.report.processed - state.processed_at_start;
        let avg_item_ms = (items_this_run > 0).then(|| {
            (now - state.started_at).num_milliseconds().max(0) as f64 / items_this_run as f64
        });
        task.update_progress(
            state.report.processed,
            state.report.succeeded,
            state.report.failed,
            avg_item_ms,
        )?;

        let pressure = MemoryLimits::from(&self.config).classify(self.memory_probe.as_ref());
        if let (MemoryPressure::Soft { used_mb }, false) = (pressure, state.memory_warned) {
            state.memory_warned = true;
            state.report.memory_warnings += 1;
            let message = format!(
                "memory soft limit exceeded after chunk {}: {used_mb}MB used (soft limit {}MB)",
                state.chunks + 1,
                self.config.memory_soft_limit_mb
            );
            warn!(task_id = %task.task_id, used_mb = used_mb, "{}", message);
            task.metadata.warnings.push(message);
        }

        task.metadata.checkpoint = Some(state.checkpoint.clone());
        task.metadata.partial_report = Some(state.report.clone());
        task.updated_at = now;
        self.context.store.tasks.save(task).await?;

        state.chunks += 1;
        log_batch_progress(task.task_id, state.chunks, &state.report);

        if let MemoryPressure::Hard { used_mb } = pressure {
            return Err(SyncError::MemoryLimit {
                used_mb,
                limit_mb: self.config.memory_hard_limit_mb,
            });
        }
        Ok(())
    }

    fn finish(&self, task: &SyncTask, mut state: RunState) -> BatchReport {
        state.report.success = state.report.failed == 0;
        info!(
            task_id = %task.task_id,
            kind = %task.kind,
            total = state.report.total,
            processed = state.report.processed,
            succeeded = state.report.succeeded,
            failed = state.report.failed,
            skipped = state.report.skipped,
            imported = state.report.imported,
            updated = state.report.updated,
            not_found = state.report.not_found,
            "📦 Bulk run finished"
        );
        state.report
    }

    async fn push_candidates(
        &self,
        connection: &Connection,
        mode: PullMode,
        after: Option<EntityId>,
    ) -> Result<Vec<PushCandidate>> {
        let chunk_size = self.config.chunk_size;
        let mut candidates = Vec::with_capacity(chunk_size);
        if mode == PullMode::Full {
            for entity in self.context.catalog.list_entities(after, chunk_size).await? {
                let link = self
                    .context
                    .store
                    .links
                    .find(entity.entity_id, connection.connection_id)
                    .await?;
                candidates.push(PushCandidate::Entity(entity, link));
            }
        } else {
            let links = self
                .context
                .store
                .links
                .list_push_candidates(connection.connection_id, after, chunk_size)
                .await?;
            for link in links {
                match self.context.catalog.load_entity(link.entity_id).await? {
                    Some(entity) => candidates.push(PushCandidate::Entity(entity, Some(link))),
                    None => candidates.push(PushCandidate::Missing(link.entity_id)),
                }
            }
        }
        Ok(candidates)
    }

    #[instrument(skip_all, fields(task_id = %task.task_id, connection_id = connection.connection_id))]
    pub async fn push_all(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
    ) -> Result<BatchReport> {
        let options = task.metadata.options.clone();
        let mode = task.metadata.filters.mode.unwrap_or(PullMode::Linked);
        let mut state = self.resume_state(task);

        let counted = match mode {
            PullMode::Full => self.context.catalog.count_entities().await?,
            _ => {
                self.context
                    .store
                    .links
                    .count_push_candidates(connection.connection_id)
                    .await?
            }
        };
        self.begin(task, &mut state, counted).await?;

        loop {
            let candidates = self
                .push_candidates(connection, mode, state.checkpoint.last_entity_id)
                .await?;
            if candidates.is_empty() {
                break;
            }
            let chunk_len = candidates.len();

            for candidate in candidates {
                let (entity, link) = match candidate {
                    PushCandidate::Missing(entity_id) => {
                        debug!(entity_id = entity_id, "Linked entity missing from catalog");
                        state.report.record_not_found();
                        state.checkpoint.last_entity_id = Some(entity_id);
                        continue;
                    }
                    PushCandidate::Entity(entity, link) => (entity, link),
                };
                state.checkpoint.last_entity_id = Some(entity.entity_id);

                if link.as_ref().is_some_and(|link| is_push_current(&entity, link)) {
                    state.report.record_skipped();
                    continue;
                }

                self.throttle(&mut state).await;
                match self
                    .context
                    .push_entity(connection, adapter, &entity, &options)
                    .await
                {
                    Ok(pushed) => match pushed.sub_failures.into_iter().next() {
                        Some(failure) => state
                            .report
                            .record_failure(failure, self.config.max_reported_errors),
                        None => state.report.record_success(),
                    },
                    Err(error @ SyncError::Repository(_)) => return Err(error),
                    Err(error) => {
                        let external_id = link.and_then(|link| link.external_id);
                        state.report.record_failure(
                            item_failure(Some(entity.entity_id), external_id, &error),
                            self.config.max_reported_errors,
                        );
                    }
                }
            }

            self.persist_chunk(task, &mut state).await?;
            if chunk_len < self.config.chunk_size {
                break;
            }
        }

        Ok(self.finish(task, state))
    }

    #[instrument(skip_all, fields(task_id = %task.task_id, connection_id = connection.connection_id))]
    pub async fn pull_linked(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
    ) -> Result<BatchReport> {
        let mut state = self.resume_state(task);
        let counted = self
            .context
            .store
            .links
            .count_linked(connection.connection_id)
            .await?;
        self.begin(task, &mut state, counted).await?;

        loop {
            let links = self
                .context
                .store
                .links
                .list_linked(
                    connection.connection_id,
                    state.checkpoint.last_entity_id,
                    self.config.chunk_size,
                )
                .await?;
            if links.is_empty() {
                break;
            }
            let chunk_len = links.len();

            let external_ids: Vec<String> = links
                .iter()
                .filter_map(|link| link.external_id.clone())
                .collect();
            self.throttle(&mut state).await;
            let markers =
                call_guarded(adapter.fetch_change_markers(connection, &external_ids)).await?;

            for link in links {
                let entity_id = link.entity_id;
                state.checkpoint.last_entity_id = Some(entity_id);
                let Some(external_id) = link.external_id.clone() else {
                    state.report.record_skipped();
                    continue;
                };

                let marker = match markers.get(&external_id) {
                    Some(marker) => *marker,
                    None => {
                        state.report.record_not_found();
                        continue;
                    }
                };
                if is_unchanged(marker, link.last_pull_at) {
                    state.report.record_skipped();
                    continue;
                }

                self.throttle(&mut state).await;
                match self
                    .context
                    .pull_entity(connection, adapter, entity_id, Some(link))
                    .await
                {
                    Ok(pulled) => tally_pull(&mut state.report, &pulled),
                    Err(error @ SyncError::Repository(_)) => return Err(error),
                    Err(error) => state.report.record_failure(
                        item_failure(Some(entity_id), Some(external_id), &error),
                        self.config.max_reported_errors,
                    ),
                }
            }

            self.persist_chunk(task, &mut state).await?;
            if chunk_len < self.config.chunk_size {
                break;
            }
        }

        Ok(self.finish(task, state))
    }

    #[instrument(skip_all, fields(task_id = %task.task_id, connection_id = connection.connection_id))]
    pub async fn pull_upstream(
        &self,
        task: &mut SyncTask,
        connection: &Connection,
        adapter: &dyn ErpAdapter,
    ) -> Result<BatchReport> {
        let filters = task.metadata.filters.clone();
        let default_mode = if task.kind == TaskKind::PullIncremental {
            PullMode::Incremental
        } else {
            PullMode::Full
        };
        let mut mode = filters.mode.unwrap_or(default_mode);
        let since = match mode {
            PullMode::Incremental => filters.since.or(connection.last_successful_sync_at),
            _ => None,
        };
        if mode == PullMode::Incremental && since.is_none() {
            mode = PullMode::Full;
        }
        let limit = filters.limit.unwrap_or(self.config.default_pull_limit);

        let mut state = self.resume_state(task);
        self.begin(task, &mut state, 0).await?;

        while state.report.processed < limit {
            self.throttle(&mut state).await;
            let request = PageRequest {
                mode,
                since,
                cursor: state.checkpoint.cursor.clone(),
                page_size: self.config.upstream_page_size,
            };
            let page = call_guarded(adapter.pull_all(connection, &request)).await?;

            let remaining = (limit - state.report.processed) as usize;
            let truncated = page.records.len() > remaining;
            let records: Vec<_> = page.records.into_iter().take(remaining).collect();
            state.report.total += records.len() as u64;

            for record in &records {
                match self
                    .context
                    .apply_record(connection.connection_id, record)
                    .await
                {
                    Ok(import) => tally_import(&mut state.report, import.created, import.changed),
                    Err(error @ SyncError::Repository(_)) => return Err(error),
                    Err(error) => state.report.record_failure(
                        item_failure(None, Some(record.external_id.clone()), &error),
                        self.config.max_reported_errors,
                    ),
                }
            }

            if !truncated {
                state.checkpoint.cursor = page.next_cursor;
            }
            self.persist_chunk(task, &mut state).await?;
            if state.checkpoint.cursor.is_none() || records.is_empty() || truncated {
                break;
            }
        }

        Ok(self.finish(task, state))
    }
}
