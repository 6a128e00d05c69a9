//! # Synchronization Orchestration
//!
//! Everything between "a task was requested" and "the task is terminal".
//!
//! ## Core Components
//!
//! - **TaskDispatcher**: enqueue surface, duplicate handling, prioritized worker pool
//! - **TaskExecutor**: runs one task through attempts, retries, timeouts and health accounting
//! - **BatchSynchronizer**: chunked bulk push and pull with checkpoints and memory guards
//! - **ChangeDetector**: cheap upstream modification probe that triggers incremental pulls
//! - **SyncScheduler**: periodic detection and scheduled bulk pushes
//!
//! ## Task Flow
//!
//! ```text
//! enqueue ─► idempotency claim ─► queue (high | default) ─► worker
//!     ─► attempt ─► success ─────────────────────────► completed | completed_with_errors
//!              └─► failure ─► retryable & attempts left ─► backoff ─► attempt
//!                          └─► otherwise ──────────────────────────► failed
//! ```

pub mod batch_synchronizer;
pub mod change_detector;
pub mod dispatcher;
pub mod entity_sync;
pub mod idempotency;
pub mod memory;
pub mod retry;
pub mod scheduler;
pub mod task_executor;

pub use batch_synchronizer::BatchSynchronizer;
pub use change_detector::{ChangeDetector, DetectionOutcome};
pub use dispatcher::{
    DispatcherHandle, EnqueueDisposition, EnqueueReceipt, EnqueueRequest, TaskDispatcher, TaskSink,
};
pub use entity_sync::{PulledEntity, PushedEntity, SyncContext};
pub use idempotency::{IdempotencyGuard, IdempotencyKey, IdempotencyRegistry};
pub use memory::{FixedMemoryProbe, MemoryLimits, MemoryPressure, MemoryProbe, ProcessMemoryProbe};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{CycleReport, SyncScheduler};
pub use task_executor::{TaskExecutor, TaskTimeouts};
