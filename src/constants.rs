//! # System Constants
//!
//! Default operational limits of the synchronization engine. Configuration
//! values fall back to these when a key is absent.

/// Default values for every configurable budget and threshold
pub mod defaults {
    // Retry policy
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BACKOFF_SECONDS: [u64; 3] = [60, 180, 600];

    // Wall-clock budgets per task kind
    pub const DETECTION_TIMEOUT_SECONDS: u64 = 60;
    pub const SINGLE_ENTITY_TIMEOUT_SECONDS: u64 = 300;
    pub const BULK_PUSH_TIMEOUT_SECONDS: u64 = 600;
    pub const BULK_PULL_TIMEOUT_SECONDS: u64 = 3600;

    // Change detection
    pub const DETECTION_INTERVAL_SECONDS: u64 = 300;
    pub const CHANGE_THRESHOLD: u64 = 1;
    pub const FALLBACK_LOOKBACK_HOURS: i64 = 24;
    pub const LIMIT_BUFFER: u64 = 100;

    // Batch synchronization
    pub const CHUNK_SIZE: usize = 100;
    pub const INTER_ITEM_DELAY_MS: u64 = 100;
    pub const MEMORY_SOFT_LIMIT_MB: u64 = 512;
    pub const MEMORY_HARD_LIMIT_MB: u64 = 1024;
    pub const MAX_REPORTED_ERRORS: usize = 20;
    pub const UPSTREAM_PAGE_SIZE: usize = 100;
    pub const DEFAULT_PULL_LIMIT: u64 = 1000;

    // Health
    pub const DEGRADED_LATENCY_MS: u64 = 5_000;

    // Dispatch
    pub const MAX_CONCURRENT_TASKS: usize = 8;
    pub const QUEUE_CAPACITY: usize = 1024;
    pub const SCHEDULER_TICK_SECONDS: u64 = 60;
}

/// Operation names used in structured log fields
pub mod operations {
    pub const TASK_ENQUEUED: &str = "task.enqueued";
    pub const TASK_ATTACHED: &str = "task.attached";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_COMPLETED_WITH_ERRORS: &str = "task.completed_with_errors";
    pub const TASK_RETRY_SCHEDULED: &str = "task.retry_scheduled";
    pub const TASK_FAILED: &str = "task.failed";
    pub const CONNECTION_HEALTH_UPDATED: &str = "connection.health_updated";
    pub const CHANGES_DETECTED: &str = "detector.changes_detected";
    pub const BATCH_CHUNK_PERSISTED: &str = "batch.chunk_persisted";
}
