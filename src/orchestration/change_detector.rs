//! # Change Detector
//!
//! A cheap, frequent probe per connection: count upstream records modified
//! since the last successful sync and, at or above the threshold, enqueue a
//! `pull_incremental` task sized to what was seen.
//!
//! The detector is monitoring-only. It never returns an error: probe and
//! dispatch failures are logged and reported as a [`DetectionOutcome`], and
//! the probe result is folded into connection health either way.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use super::dispatcher::{EnqueueRequest, TaskSink};
use super::task_executor::TaskExecutor;
use crate::adapter::{call_guarded, AdapterError, AdapterRegistry};
use crate::clock::Clock;
use crate::config::{ChangeDetectionConfig, SyncConfig};
use crate::constants::operations;
use crate::logging::log_connection_operation;
use crate::models::{
    CallOutcome, CallReport, Connection, HealthPolicy, PullMode, TaskFilters, TaskId, TaskKind,
};
use crate::repository::SyncStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Connection inactive, pull disabled, or auto-pull off
    Skipped { reason: &'static str },
    BelowThreshold {
        count: u64,
        since: DateTime<Utc>,
    },
    Dispatched {
        task_id: TaskId,
        count: u64,
        since: DateTime<Utc>,
        limit: u64,
    },
    /// The count query itself failed
    ProbeFailed { error: String },
    /// Changes were seen but the follow-up task could not be enqueued
    DispatchFailed { count: u64, error: String },
}

pub struct ChangeDetector {
    store: SyncStore,
    adapters: Arc<AdapterRegistry>,
    clock: Arc<dyn Clock>,
    config: ChangeDetectionConfig,
    probe_timeout: Duration,
    health_policy: HealthPolicy,
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("config", &self.config)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl ChangeDetector {
    pub fn new(
        store: SyncStore,
        adapters: Arc<AdapterRegistry>,
        clock: Arc<dyn Clock>,
        config: ChangeDetectionConfig,
        probe_timeout: Duration,
        health_policy: HealthPolicy,
    ) -> Self {
        Self {
            store,
            adapters,
            clock,
            config,
            probe_timeout,
            health_policy,
        }
    }

    /// Share the executor's store, adapters, clock and health thresholds
    pub fn for_executor(executor: &TaskExecutor, config: &SyncConfig) -> Self {
        let context = executor.context();
        Self::new(
            context.store.clone(),
            Arc::clone(executor.adapters()),
            Arc::clone(&context.clock),
            config.change_detection.clone(),
            config.timeouts.detection_timeout(),
            *executor.health_policy(),
        )
    }

    pub fn config(&self) -> &ChangeDetectionConfig {
        &self.config
    }

    /// Window start for the count query
    pub fn since_for(&self, connection: &Connection) -> DateTime<Utc> {
        connection
            .last_successful_sync_at
            .unwrap_or_else(|| self.clock.now() - self.config.fallback_lookback())
    }

    #[instrument(skip_all, fields(connection_id = connection.connection_id))]
    pub async fn detect(&self, connection: &Connection, sink: &dyn TaskSink) -> DetectionOutcome {
        if !connection.is_active {
            return DetectionOutcome::Skipped {
                reason: "connection inactive",
            };
        }
        if !connection.sync_mode.allows_pull() {
            return DetectionOutcome::Skipped {
                reason: "pull disabled by sync mode",
            };
        }
        if !connection.schedule.auto_pull {
            return DetectionOutcome::Skipped {
                reason: "auto pull disabled",
            };
        }

        let since = self.since_for(connection);
        let count = match self.probe(connection, since).await {
            Ok(count) => count,
            Err(error) => {
                warn!(error = %error, "Change detection probe failed");
                return DetectionOutcome::ProbeFailed { error };
            }
        };

        if count < self.config.threshold {
            debug!(count = count, threshold = self.config.threshold, "No sync needed");
            return DetectionOutcome::BelowThreshold { count, since };
        }

        let limit = count + self.config.limit_buffer;
        let request = EnqueueRequest::new(TaskKind::PullIncremental, connection.connection_id)
            .with_filters(TaskFilters {
                mode: Some(PullMode::Incremental),
                since: Some(since),
                limit: Some(limit),
                resume_from: None,
            })
            .observed(count);

        match sink.submit(request).await {
            Ok(receipt) => {
                info!(
                    operation = operations::CHANGES_DETECTED,
                    task_id = %receipt.task_id,
                    count = count,
                    since = %since,
                    limit = limit,
                    "🔎 Upstream changes detected, incremental pull dispatched"
                );
                DetectionOutcome::Dispatched {
                    task_id: receipt.task_id,
                    count,
                    since,
                    limit,
                }
            }
            Err(error) => {
                warn!(count = count, error = %error, "Could not dispatch incremental pull");
                DetectionOutcome::DispatchFailed {
                    count,
                    error: error.to_string(),
                }
            }
        }
    }

    /// Run the count query and record its outcome on the connection
    async fn probe(&self, connection: &Connection, since: DateTime<Utc>) -> Result<u64, String> {
        let adapter = self
            .adapters
            .resolve(connection)
            .map_err(|error| error.to_string())?;

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.probe_timeout,
            call_guarded(adapter.count_modified_since(connection, since)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Connection(format!(
                "change probe timed out after {}ms",
                self.probe_timeout.as_millis()
            ))),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(error) if !error.contacted_remote() => {
                debug!(
                    connection_id = connection.connection_id,
                    error = %error,
                    "Change count unavailable; health left untouched"
                );
                return Err(error.to_string());
            }
            Err(error) if error.reached_remote() => CallOutcome::Rejected(error.to_string()),
            Err(error) => CallOutcome::Failed(error.to_string()),
        };
        let report = CallReport::probe(self.clock.now(), outcome, Some(latency_ms));
        match self
            .store
            .connections
            .record_call(connection.connection_id, &report, &self.health_policy)
            .await
        {
            Ok(updated) if updated.health != connection.health => {
                log_connection_operation(operations::CONNECTION_HEALTH_UPDATED, &updated);
            }
            Ok(_) => {}
            Err(error) => warn!(error = %error, "Could not record probe outcome"),
        }

        result.map_err(|error| error.to_string())
    }
}
