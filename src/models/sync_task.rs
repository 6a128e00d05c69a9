//! # Sync Task Model
//!
//! One persisted unit of synchronization work, single-entity or batch.
//!
//! ## Overview
//!
//! A `SyncTask` is created at dispatch time and then mutated only by the
//! worker executing it. All status changes go through the pure transition
//! function in [`crate::state_machine`], which keeps status monotonic:
//!
//! ```text
//! pending ──start──▶ running ──complete──────────────▶ completed
//!    │                  ├────complete_with_errors─────▶ completed_with_errors
//!    └──────fail────────┴────fail─────────────────────▶ failed
//! ```
//!
//! ## Invariants
//!
//! - `processed_items <= total_items` at every observable instant
//! - `progress_percentage` is `processed / total * 100` clamped to `[0, 100]`,
//!   and exactly `100` once the task is terminal
//! - `started_at` is recorded once, on the first `start`

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::{ConnectionId, EntityId, TaskId};
use crate::error::ErrorKind;
use crate::state_machine::errors::guard_failed;
use crate::state_machine::{determine_target_state, StateMachineResult, TaskEvent, TaskState};

/// What a task does; selects the adapter operation and timeout budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    PushOne,
    PullOne,
    PushAll,
    PullAll,
    PullLinked,
    PullIncremental,
    DetectOnly,
    HealthCheck,
}

/// Wall-clock budget class of a task kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Detection,
    SingleEntity,
    BulkPush,
    BulkPull,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PushOne => "push_one",
            Self::PullOne => "pull_one",
            Self::PushAll => "push_all",
            Self::PullAll => "pull_all",
            Self::PullLinked => "pull_linked",
            Self::PullIncremental => "pull_incremental",
            Self::DetectOnly => "detect_only",
            Self::HealthCheck => "health_check",
        }
    }

    pub fn requires_entity(&self) -> bool {
        matches!(self, Self::PushOne | Self::PullOne)
    }

    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            Self::PushAll | Self::PullAll | Self::PullLinked | Self::PullIncremental
        )
    }

    pub fn is_push(&self) -> bool {
        matches!(self, Self::PushOne | Self::PushAll)
    }

    pub fn is_pull(&self) -> bool {
        matches!(
            self,
            Self::PullOne | Self::PullAll | Self::PullLinked | Self::PullIncremental
        )
    }

    /// Probes only touch connection health, never sync statistics
    pub fn is_probe(&self) -> bool {
        matches!(self, Self::DetectOnly | Self::HealthCheck)
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Self::DetectOnly | Self::HealthCheck => TimeoutClass::Detection,
            Self::PushOne | Self::PullOne => TimeoutClass::SingleEntity,
            Self::PushAll => TimeoutClass::BulkPush,
            Self::PullAll | Self::PullLinked | Self::PullIncremental => TimeoutClass::BulkPull,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push_one" => Ok(Self::PushOne),
            "pull_one" => Ok(Self::PullOne),
            "push_all" => Ok(Self::PushAll),
            "pull_all" => Ok(Self::PullAll),
            "pull_linked" => Ok(Self::PullLinked),
            "pull_incremental" => Ok(Self::PullIncremental),
            "detect_only" => Ok(Self::DetectOnly),
            "health_check" => Ok(Self::HealthCheck),
            _ => Err(format!("Invalid task kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueue {
    High,
    #[default]
    Default,
}

impl TaskQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskQueue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "default" => Ok(Self::Default),
            _ => Err(format!("Invalid task queue: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    /// Entire upstream listing (discovery)
    Full,
    /// Upstream records modified since a timestamp
    Incremental,
    /// Only entities already linked to the connection
    Linked,
}

/// Typed push options, validated before any external call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncOptions {
    /// Restrict a push to these fields; empty means all known-dirty fields
    pub fields: Vec<String>,
    pub sync_prices: bool,
    pub sync_stock: bool,
}

impl SyncOptions {
    pub fn fields(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (index, field) in self.fields.iter().enumerate() {
            if field.trim().is_empty() {
                return Err("field names must not be blank".to_string());
            }
            if self.fields[..index].contains(field) {
                return Err(format!("field '{field}' listed more than once"));
            }
        }
        Ok(())
    }
}

/// Resume position of a bulk run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Checkpoint {
    /// Last fully processed entity id (link/catalog ordered runs)
    pub last_entity_id: Option<EntityId>,
    /// Next upstream page cursor (paged pulls)
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskFilters {
    pub mode: Option<PullMode>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    /// Start a bulk run from a previously recorded position
    pub resume_from: Option<Checkpoint>,
}

/// Per-item failure inside a batch (or a sub-item of a single push)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub entity_id: Option<EntityId>,
    pub external_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Aggregate outcome of a bulk run; also the `pullAll` / `pullLinked` result shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BatchReport {
    pub success: bool,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub imported: u64,
    pub updated: u64,
    pub skipped: u64,
    pub not_found: u64,
    /// First N item failures; `failed` carries the full count
    pub errors: Vec<ItemFailure>,
    pub memory_warnings: u32,
    pub rate_limit_wait_ms: u64,
}

impl BatchReport {
    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    /// Nothing to do for this item; it counts as succeeded
    pub fn record_skipped(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
        self.skipped += 1;
    }

    /// Linked record no longer exists upstream
    pub fn record_not_found(&mut self) {
        self.processed += 1;
        self.not_found += 1;
    }

    pub fn record_failure(&mut self, failure: ItemFailure, max_reported: usize) {
        self.processed += 1;
        self.failed += 1;
        if self.errors.len() < max_reported {
            self.errors.push(failure);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskMetadata {
    pub filters: TaskFilters,
    pub options: SyncOptions,
    pub checkpoint: Option<Checkpoint>,
    /// Tallies carried across a resumed bulk run
    pub partial_report: Option<BatchReport>,
    /// Upstream modification count seen by the change detector
    pub observed_count: Option<u64>,
    pub attempts: u32,
    pub last_attempt_error: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ErrorDetails {
    pub detail: Option<String>,
    pub trace: Option<String>,
    pub items: Vec<ItemFailure>,
}

/// Read-only projection served by `get_task`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub status: TaskState,
    pub message: String,
    pub processed: u64,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub progress_percentage: f64,
    pub result_summary: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub connection_id: ConnectionId,
    pub entity_id: Option<EntityId>,
    pub queue: TaskQueue,
    pub status: TaskState,
    pub total_items: u64,
    pub processed_items: u64,
    pub succeeded_items: u64,
    pub failed_items: u64,
    pub progress_percentage: f64,
    pub avg_item_duration_ms: Option<f64>,
    pub metadata: TaskMetadata,
    pub error_summary: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_details: Option<ErrorDetails>,
    pub result_summary: Option<Value>,
    /// Acting user; `None` for system-triggered tasks
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SyncTask {
    pub fn new(
        kind: TaskKind,
        connection_id: ConnectionId,
        entity_id: Option<EntityId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            kind,
            connection_id,
            entity_id,
            queue: TaskQueue::Default,
            status: TaskState::Pending,
            total_items: 0,
            processed_items: 0,
            succeeded_items: 0,
            failed_items: 0,
            progress_percentage: 0.0,
            avg_item_duration_ms: None,
            metadata: TaskMetadata::default(),
            error_summary: None,
            error_kind: None,
            error_details: None,
            result_summary: None,
            triggered_by: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> StateMachineResult<()> {
        self.apply(&TaskEvent::Start, now)?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    /// Set (or grow) the item total; never below what is already processed
    pub fn set_total_items(&mut self, total: u64) -> StateMachineResult<()> {
        if self.status.is_terminal() {
            return Err(guard_failed(format!(
                "cannot change totals of a {} task",
                self.status
            )));
        }
        if total < self.processed_items {
            return Err(guard_failed(format!(
                "total {total} is below processed {}",
                self.processed_items
            )));
        }
        self.total_items = total;
        self.recompute_progress();
        Ok(())
    }

    pub fn update_progress(
        &mut self,
        processed: u64,
        succeeded: u64,
        failed: u64,
        avg_item_duration_ms: Option<f64>,
    ) -> StateMachineResult<()> {
        if self.status != TaskState::Running {
            return Err(guard_failed(format!(
                "progress can only be reported while running, task is {}",
                self.status
            )));
        }
        if processed > self.total_items {
            return Err(guard_failed(format!(
                "processed {processed} exceeds total {}",
                self.total_items
            )));
        }
        if succeeded + failed > processed {
            return Err(guard_failed(format!(
                "succeeded {succeeded} + failed {failed} exceeds processed {processed}"
            )));
        }
        self.processed_items = processed;
        self.succeeded_items = succeeded;
        self.failed_items = failed;
        if avg_item_duration_ms.is_some() {
            self.avg_item_duration_ms = avg_item_duration_ms;
        }
        self.recompute_progress();
        Ok(())
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> StateMachineResult<()> {
        if self.failed_items > 0 {
            return Err(guard_failed(format!(
                "{} items failed, use complete_with_errors",
                self.failed_items
            )));
        }
        self.apply(&TaskEvent::Complete, now)?;
        self.result_summary = Some(result);
        Ok(())
    }

    pub fn complete_with_errors(
        &mut self,
        result: Value,
        failures: Vec<ItemFailure>,
        now: DateTime<Utc>,
    ) -> StateMachineResult<()> {
        self.apply(&TaskEvent::CompleteWithErrors, now)?;
        self.result_summary = Some(result);
        self.error_kind = Some(ErrorKind::PartialFailure);
        self.error_summary = Some(format!(
            "{} of {} items failed",
            self.failed_items, self.total_items
        ));
        self.error_details = Some(ErrorDetails {
            detail: None,
            trace: None,
            items: failures,
        });
        Ok(())
    }

    pub fn fail(
        &mut self,
        message: impl Into<String>,
        detail: Option<String>,
        trace: Option<String>,
        kind: ErrorKind,
        now: DateTime<Utc>,
    ) -> StateMachineResult<()> {
        let message = message.into();
        self.apply(&TaskEvent::Fail(message.clone()), now)?;
        self.error_summary = Some(message);
        self.error_kind = Some(kind);
        self.error_details = Some(ErrorDetails {
            detail,
            trace,
            items: Vec::new(),
        });
        Ok(())
    }

    pub fn duration(&self) -> Option<ChronoDuration> {
        let started = self.started_at?;
        let finished = self.completed_at.unwrap_or(self.updated_at);
        Some(finished - started)
    }

    /// Percentage of processed items that succeeded
    pub fn success_rate(&self) -> Option<f64> {
        if self.processed_items == 0 {
            return None;
        }
        Some(self.succeeded_items as f64 / self.processed_items as f64 * 100.0)
    }

    /// Remaining time extrapolated from the average item duration
    pub fn estimated_remaining(&self) -> Option<ChronoDuration> {
        if self.status != TaskState::Running {
            return None;
        }
        let avg = self.avg_item_duration_ms?;
        let remaining = self.total_items.saturating_sub(self.processed_items) as f64;
        Some(ChronoDuration::milliseconds((avg * remaining).round() as i64))
    }

    pub fn status_message(&self) -> String {
        match self.status {
            TaskState::Pending => "Waiting for a worker".to_string(),
            TaskState::Running if self.total_items > 0 => format!(
                "Processing {}/{} items ({:.1}%)",
                self.processed_items, self.total_items, self.progress_percentage
            ),
            TaskState::Running => "Running".to_string(),
            TaskState::Completed => {
                format!("Completed: {} items synchronized", self.succeeded_items)
            }
            TaskState::CompletedWithErrors => format!(
                "Completed with errors: {} of {} items failed",
                self.failed_items, self.total_items
            ),
            TaskState::Failed => format!(
                "Failed: {}",
                self.error_summary.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    pub fn status_view(&self) -> TaskStatusView {
        TaskStatusView {
            task_id: self.task_id,
            kind: self.kind,
            status: self.status,
            message: self.status_message(),
            processed: self.processed_items,
            total: self.total_items,
            succeeded: self.succeeded_items,
            failed: self.failed_items,
            progress_percentage: self.progress_percentage,
            result_summary: self.result_summary.clone(),
            error_kind: self.error_kind,
            error_details: self.error_details.clone(),
        }
    }

    fn apply(&mut self, event: &TaskEvent, now: DateTime<Utc>) -> StateMachineResult<()> {
        let target = determine_target_state(self.status, event)?;
        self.status = target;
        self.updated_at = now;
        if target.is_terminal() {
            self.completed_at = Some(now);
        }
        self.recompute_progress();
        Ok(())
    }

    fn recompute_progress(&mut self) {
        self.progress_percentage = if self.status.is_terminal() {
            100.0
        } else if self.total_items == 0 {
            0.0
        } else {
            (self.processed_items as f64 / self.total_items as f64 * 100.0).clamp(0.0, 100.0)
        };
    }
}
