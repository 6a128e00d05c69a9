//! # Connection Model
//!
//! One configured external ERP system: its type, scheduling policy and the
//! live health/statistics state that every task targeting it updates.
//!
//! ## Health Updates
//!
//! Health and statistics are only ever changed through
//! [`Connection::apply_call_report`], which the task executor and change
//! detector call right after an external call returns. There is no
//! background poller: health always reflects real traffic.
//!
//! | Call outcome | Health | Statistics |
//! |---|---|---|
//! | success | `connected` (or `degraded` above the latency threshold) | success +1 |
//! | partial batch | `degraded` | success +1 |
//! | rejected (validation, duplicate) | `connected` | failure +1 |
//! | failed (network, timeout, remote) | `error` | failure +1 |

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ConnectionId;

/// External system flavour; selects the adapter implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErpType {
    Baselinker,
    SubiektGt,
    Dynamics,
    Insert,
    Custom,
}

impl ErpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baselinker => "baselinker",
            Self::SubiektGt => "subiekt_gt",
            Self::Dynamics => "dynamics",
            Self::Insert => "insert",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ErpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baselinker" => Ok(Self::Baselinker),
            "subiekt_gt" => Ok(Self::SubiektGt),
            "dynamics" => Ok(Self::Dynamics),
            "insert" => Ok(Self::Insert),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("Invalid ERP type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Connected,
    Degraded,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "connected" => Ok(Self::Connected),
            "degraded" => Ok(Self::Degraded),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid health status: {s}")),
        }
    }
}

/// Which directions a connection may synchronize in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Bidirectional,
    PushOnly,
    PullOnly,
    Disabled,
}

impl SyncMode {
    pub fn allows_push(&self) -> bool {
        matches!(self, Self::Bidirectional | Self::PushOnly)
    }

    pub fn allows_pull(&self) -> bool {
        matches!(self, Self::Bidirectional | Self::PullOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidirectional => "bidirectional",
            Self::PushOnly => "push_only",
            Self::PullOnly => "pull_only",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bidirectional" => Ok(Self::Bidirectional),
            "push_only" => Ok(Self::PushOnly),
            "pull_only" => Ok(Self::PullOnly),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("Invalid sync mode: {s}")),
        }
    }
}

/// Scheduling policy owned by the connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulePolicy {
    /// Minutes between scheduled bulk runs; `None` disables scheduling
    pub interval_minutes: Option<u32>,
    pub auto_pull: bool,
    pub auto_push: bool,
    pub auto_stock: bool,
    pub auto_prices: bool,
}

impl SchedulePolicy {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::minutes(i64::from(minutes)))
    }
}

/// Cumulative synchronization statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionStats {
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub avg_duration_ms: f64,
    pub avg_payload_bytes: Option<f64>,
    pub payload_samples: u64,
    pub records_synced_total: u64,
}

impl ConnectionStats {
    pub fn total_syncs(&self) -> u64 {
        self.successful_syncs + self.failed_syncs
    }

    /// Percentage of successful syncs, `None` before the first sync
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.total_syncs();
        if total == 0 {
            return None;
        }
        Some(self.successful_syncs as f64 / total as f64 * 100.0)
    }

    fn record(&mut self, success: bool, duration_ms: Option<u64>) {
        if success {
            self.successful_syncs += 1;
        } else {
            self.failed_syncs += 1;
        }
        if let Some(duration_ms) = duration_ms {
            let n = self.total_syncs() as f64;
            self.avg_duration_ms += (duration_ms as f64 - self.avg_duration_ms) / n;
        }
    }

    fn record_payload(&mut self, bytes: u64) {
        self.payload_samples += 1;
        let current = self.avg_payload_bytes.unwrap_or(0.0);
        let n = self.payload_samples as f64;
        self.avg_payload_bytes = Some(current + (bytes as f64 - current) / n);
    }
}

/// Thresholds used when deriving health from a call report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub degraded_latency_ms: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degraded_latency_ms: crate::constants::defaults::DEGRADED_LATENCY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    /// Batch completed with some failed items
    PartialSuccess,
    /// The external system answered but refused the request
    Rejected(String),
    /// The external system could not be reached or failed
    Failed(String),
}

/// What one external call looked like, as observed by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReport {
    pub at: DateTime<Utc>,
    pub outcome: CallOutcome,
    pub latency_ms: Option<u64>,
    /// Probes (health checks, change counts) update health only
    pub counts_as_sync: bool,
    pub duration_ms: Option<u64>,
    pub payload_bytes: Option<u64>,
    pub records: u64,
}

impl CallReport {
    pub fn new(at: DateTime<Utc>, outcome: CallOutcome) -> Self {
        Self {
            at,
            outcome,
            latency_ms: None,
            counts_as_sync: true,
            duration_ms: None,
            payload_bytes: None,
            records: 0,
        }
    }

    pub fn probe(at: DateTime<Utc>, outcome: CallOutcome, latency_ms: Option<u64>) -> Self {
        Self {
            latency_ms,
            counts_as_sync: false,
            ..Self::new(at, outcome)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub name: String,
    pub erp_type: ErpType,
    /// Reference into the credential store; never the secret itself
    pub credentials_ref: Option<String>,
    pub is_active: bool,
    pub sync_mode: SyncMode,
    pub schedule: SchedulePolicy,
    pub health: HealthStatus,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub auto_disable_on_errors: bool,
    pub error_threshold: u32,
    pub stats: ConnectionStats,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub next_scheduled_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        connection_id: ConnectionId,
        name: impl Into<String>,
        erp_type: ErpType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            connection_id,
            name: name.into(),
            erp_type,
            credentials_ref: None,
            is_active: true,
            sync_mode: SyncMode::default(),
            schedule: SchedulePolicy::default(),
            health: HealthStatus::Unknown,
            last_health_check_at: None,
            last_latency_ms: None,
            last_error: None,
            consecutive_failures: 0,
            auto_disable_on_errors: false,
            error_threshold: 10,
            stats: ConnectionStats::default(),
            last_successful_sync_at: None,
            next_scheduled_sync_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_schedule(mut self, schedule: SchedulePolicy) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    pub fn with_auto_disable(mut self, error_threshold: u32) -> Self {
        self.auto_disable_on_errors = true;
        self.error_threshold = error_threshold;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Whether a scheduled bulk run is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.schedule.interval().is_none() {
            return false;
        }
        self.next_scheduled_sync_at.map_or(true, |at| at <= now)
    }

    /// Fold the result of one external call into health and statistics
    pub fn apply_call_report(&mut self, report: &CallReport, policy: &HealthPolicy) {
        self.last_health_check_at = Some(report.at);
        if report.latency_ms.is_some() {
            self.last_latency_ms = report.latency_ms;
        }
        self.updated_at = report.at;

        match &report.outcome {
            CallOutcome::Success | CallOutcome::PartialSuccess => {
                let slow = report
                    .latency_ms
                    .is_some_and(|latency| latency > policy.degraded_latency_ms);
                let partial = report.outcome == CallOutcome::PartialSuccess;
                self.health = if slow || partial {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Connected
                };
                self.last_error = None;
                self.consecutive_failures = 0;

                if report.counts_as_sync {
                    self.stats.record(true, report.duration_ms);
                    if let Some(bytes) = report.payload_bytes {
                        self.stats.record_payload(bytes);
                    }
                    self.stats.records_synced_total += report.records;
                    self.last_successful_sync_at = Some(report.at);
                    self.next_scheduled_sync_at =
                        self.schedule.interval().map(|interval| report.at + interval);
                }
            }
            CallOutcome::Rejected(message) => {
                self.health = HealthStatus::Connected;
                self.last_error = Some(message.clone());
                if report.counts_as_sync {
                    self.stats.record(false, report.duration_ms);
                }
            }
            CallOutcome::Failed(message) => {
                self.health = HealthStatus::Error;
                self.last_error = Some(message.clone());
                self.consecutive_failures += 1;
                if report.counts_as_sync {
                    self.stats.record(false, report.duration_ms);
                }
                if self.auto_disable_on_errors && self.consecutive_failures >= self.error_threshold
                {
                    self.is_active = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn connection() -> Connection {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        Connection::new(1, "warehouse", ErpType::SubiektGt, now)
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap()
    }

    #[test]
    fn test_success_marks_connected_and_updates_stats() {
        let mut conn = connection().with_schedule(SchedulePolicy {
            interval_minutes: Some(30),
            ..SchedulePolicy::default()
        });
        let mut report = CallReport::new(at(0), CallOutcome::Success);
        report.latency_ms = Some(120);
        report.duration_ms = Some(200);
        report.payload_bytes = Some(1000);
        report.records = 1;

        conn.apply_call_report(&report, &HealthPolicy::default());

        assert_eq!(conn.health, HealthStatus::Connected);
        assert_eq!(conn.last_latency_ms, Some(120));
        assert_eq!(conn.stats.successful_syncs, 1);
        assert_eq!(conn.stats.avg_duration_ms, 200.0);
        assert_eq!(conn.stats.avg_payload_bytes, Some(1000.0));
        assert_eq!(conn.last_successful_sync_at, Some(at(0)));
        assert_eq!(conn.next_scheduled_sync_at, Some(at(30)));
    }

    #[test]
    fn test_average_duration_is_cumulative() {
        let mut conn = connection();
        for (minute, duration) in [(0, 100), (1, 300)] {
            let mut report = CallReport::new(at(minute), CallOutcome::Success);
            report.duration_ms = Some(duration);
            conn.apply_call_report(&report, &HealthPolicy::default());
        }
        let mut failed = CallReport::new(at(2), CallOutcome::Failed("down".into()));
        failed.duration_ms = Some(500);
        conn.apply_call_report(&failed, &HealthPolicy::default());

        assert_eq!(conn.stats.avg_duration_ms, 300.0);
        assert_eq!(conn.stats.total_syncs(), 3);
    }

    #[test]
    fn test_slow_success_is_degraded() {
        let mut conn = connection();
        let report = CallReport::probe(at(0), CallOutcome::Success, Some(9_000));
        conn.apply_call_report(&report, &HealthPolicy::default());
        assert_eq!(conn.health, HealthStatus::Degraded);
        assert_eq!(conn.stats.total_syncs(), 0, "probes never count as syncs");
    }

    #[test]
    fn test_failure_retains_last_message() {
        let mut conn = connection();
        conn.apply_call_report(
            &CallReport::new(at(0), CallOutcome::Failed("timeout".into())),
            &HealthPolicy::default(),
        );
        conn.apply_call_report(
            &CallReport::new(at(1), CallOutcome::Failed("connection refused".into())),
            &HealthPolicy::default(),
        );
        assert_eq!(conn.health, HealthStatus::Error);
        assert_eq!(conn.last_error.as_deref(), Some("connection refused"));
        assert_eq!(conn.consecutive_failures, 2);
        assert_eq!(conn.stats.failed_syncs, 2);
        assert_eq!(conn.stats.success_rate(), Some(0.0));
    }

    #[test]
    fn test_rejection_keeps_connection_healthy() {
        let mut conn = connection();
        conn.apply_call_report(
            &CallReport::new(at(0), CallOutcome::Rejected("sku missing".into())),
            &HealthPolicy::default(),
        );
        assert_eq!(conn.health, HealthStatus::Connected);
        assert_eq!(conn.consecutive_failures, 0);
        assert_eq!(conn.stats.failed_syncs, 1);
    }

    #[test]
    fn test_auto_disable_after_threshold() {
        let mut conn = connection().with_auto_disable(2);
        for minute in 0..2 {
            conn.apply_call_report(
                &CallReport::new(at(minute), CallOutcome::Failed("down".into())),
                &HealthPolicy::default(),
            );
        }
        assert!(!conn.is_active);
    }

    #[test]
    fn test_is_due() {
        let mut conn = connection();
        assert!(!conn.is_due(at(0)), "no interval means never due");

        conn.schedule.interval_minutes = Some(15);
        assert!(conn.is_due(at(0)), "never synced means due");

        conn.next_scheduled_sync_at = Some(at(10));
        assert!(!conn.is_due(at(5)));
        assert!(conn.is_due(at(10)));
    }

    #[test]
    fn test_sync_mode_directions() {
        assert!(SyncMode::Bidirectional.allows_push());
        assert!(SyncMode::Bidirectional.allows_pull());
        assert!(!SyncMode::PullOnly.allows_push());
        assert!(!SyncMode::PushOnly.allows_pull());
        assert!(!SyncMode::Disabled.allows_pull());
    }
}
