//! # Sync Scheduler
//!
//! Periodic driver for the two kinds of system-triggered work:
//!
//! - **Change detection** per active connection, every
//!   `change_detection.interval_seconds`
//! - **Scheduled bulk pushes** for connections with `auto_push` and a
//!   configured interval, whenever `next_scheduled_sync_at` has passed
//!
//! One cycle never fails because of a single connection; per-connection
//! problems are logged and the cycle moves on.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::change_detector::{ChangeDetector, DetectionOutcome};
use super::dispatcher::{EnqueueRequest, TaskDispatcher};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::models::{Connection, ConnectionId, SyncOptions, TaskId, TaskKind};

/// What one scheduler cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub connections: usize,
    pub detections: Vec<(ConnectionId, DetectionOutcome)>,
    pub scheduled_pushes: Vec<(ConnectionId, TaskId)>,
}

pub struct SyncScheduler {
    dispatcher: Arc<TaskDispatcher>,
    detector: ChangeDetector,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    last_detection: DashMap<ConnectionId, DateTime<Utc>>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("config", &self.config)
            .field("detector", &self.detector)
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    pub fn new(dispatcher: Arc<TaskDispatcher>, detector: ChangeDetector, config: SchedulerConfig) -> Self {
        let clock = Arc::clone(&dispatcher.executor().context().clock);
        Self {
            dispatcher,
            detector,
            clock,
            config,
            last_detection: DashMap::new(),
        }
    }

    fn detection_due(&self, connection_id: ConnectionId, now: DateTime<Utc>) -> bool {
        let interval = chrono::Duration::seconds(
            i64::try_from(self.detector.config().interval_seconds).unwrap_or(i64::MAX),
        );
        self.last_detection
            .get(&connection_id)
            .map_or(true, |last| now - *last >= interval)
    }

    /// Run detection and scheduled pushes once for every active connection
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let connections = self
            .dispatcher
            .executor()
            .context()
            .store
            .connections
            .list_active()
            .await?;

        let mut report = CycleReport {
            connections: connections.len(),
            ..CycleReport::default()
        };

        for connection in &connections {
            let now = self.clock.now();
            if self.detection_due(connection.connection_id, now) {
                self.last_detection.insert(connection.connection_id, now);
                let outcome = self
                    .detector
                    .detect(connection, self.dispatcher.as_ref())
                    .await;
                report.detections.push((connection.connection_id, outcome));
            }

            if let Some(task_id) = self.schedule_push(connection, now).await {
                report.scheduled_pushes.push((connection.connection_id, task_id));
            }
        }

        Ok(report)
    }

    async fn schedule_push(&self, connection: &Connection, now: DateTime<Utc>) -> Option<TaskId> {
        if !connection.schedule.auto_push
            || !connection.sync_mode.allows_push()
            || !connection.is_due(now)
        {
            return None;
        }

        let options = SyncOptions {
            sync_stock: connection.schedule.auto_stock,
            sync_prices: connection.schedule.auto_prices,
            ..SyncOptions::default()
        };
        let request =
            EnqueueRequest::new(TaskKind::PushAll, connection.connection_id).with_options(options);

        let task_id = match self.dispatcher.enqueue(request).await {
            Ok(receipt) => receipt.task_id,
            Err(error) => {
                warn!(
                    connection_id = connection.connection_id,
                    error = %error,
                    "Scheduled push could not be dispatched"
                );
                return None;
            }
        };

        let next = connection.schedule.interval().map(|interval| now + interval);
        if let Err(error) = self
            .dispatcher
            .executor()
            .context()
            .store
            .connections
            .schedule_next(connection.connection_id, next)
            .await
        {
            warn!(
                connection_id = connection.connection_id,
                error = %error,
                "Could not advance next scheduled sync"
            );
        }
        debug!(
            connection_id = connection.connection_id,
            task_id = %task_id,
            next = ?next,
            "Scheduled push dispatched"
        );
        Some(task_id)
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(tick_seconds = self.config.tick_seconds, "⏱️ Sync scheduler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let cycle_start = Instant::now();
                match self.run_cycle().await {
                    Ok(report) => debug!(
                        connections = report.connections,
                        detections = report.detections.len(),
                        scheduled_pushes = report.scheduled_pushes.len(),
                        duration_ms = cycle_start.elapsed().as_millis() as u64,
                        "Completed scheduler cycle"
                    ),
                    Err(error) => error!(error = %error, "Scheduler cycle failed"),
                }
            }

            info!("Sync scheduler stopped");
        })
    }
}
