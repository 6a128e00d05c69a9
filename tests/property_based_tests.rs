use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::time::Duration;

use erp_sync_core::error::ErrorKind;
use erp_sync_core::models::{BatchReport, ItemFailure, SyncTask, TaskKind};
use erp_sync_core::orchestration::{RetryDecision, RetryPolicy};
use erp_sync_core::state_machine::{determine_target_state, TaskEvent, TaskState};

fn event_strategy() -> impl Strategy<Value = TaskEvent> {
    prop_oneof![
        Just(TaskEvent::Start),
        Just(TaskEvent::Complete),
        Just(TaskEvent::CompleteWithErrors),
        "[a-z ]{1,20}".prop_map(TaskEvent::Fail),
    ]
}

fn error_kind_strategy() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Validation),
        Just(ErrorKind::Duplicate),
        Just(ErrorKind::DuplicateInFlight),
        Just(ErrorKind::ConnectionNotFound),
        Just(ErrorKind::UnsupportedErpType),
        Just(ErrorKind::ConnectionInactive),
        Just(ErrorKind::ConnectionError),
        Just(ErrorKind::Timeout),
        Just(ErrorKind::PartialFailure),
        Just(ErrorKind::MemoryLimit),
        Just(ErrorKind::Storage),
        Just(ErrorKind::Internal),
    ]
}

#[derive(Debug, Clone, Copy)]
enum ItemResult {
    Success,
    Skipped,
    NotFound,
    Failed,
}

fn item_result_strategy() -> impl Strategy<Value = ItemResult> {
    prop_oneof![
        Just(ItemResult::Success),
        Just(ItemResult::Skipped),
        Just(ItemResult::NotFound),
        Just(ItemResult::Failed),
    ]
}

proptest! {
    /// Property: once a task is terminal no event moves it again
    #[test]
    fn terminal_states_are_final(events in prop::collection::vec(event_strategy(), 1..12)) {
        let mut state = TaskState::Pending;
        let mut terminal_seen = false;
        for event in &events {
            if let Ok(next) = determine_target_state(state, event) {
                prop_assert!(!terminal_seen, "{state} moved to {next} on {}", event.event_type());
                state = next;
            }
            terminal_seen |= state.is_terminal();
        }
    }

    /// Property: every processed item lands in exactly one outcome bucket
    #[test]
    fn batch_report_counters_add_up(
        results in prop::collection::vec(item_result_strategy(), 0..200),
        max_reported in 0usize..20,
    ) {
        let mut report = BatchReport::default();
        for (index, result) in results.iter().enumerate() {
            match result {
                ItemResult::Success => report.record_success(),
                ItemResult::Skipped => report.record_skipped(),
                ItemResult::NotFound => report.record_not_found(),
                ItemResult::Failed => report.record_failure(
                    ItemFailure {
                        entity_id: Some(index as i64),
                        external_id: None,
                        kind: ErrorKind::Validation,
                        message: "rejected".to_string(),
                    },
                    max_reported,
                ),
            }
        }

        prop_assert_eq!(report.processed, results.len() as u64);
        prop_assert_eq!(report.processed, report.succeeded + report.failed + report.not_found);
        prop_assert!(report.skipped <= report.succeeded);
        prop_assert!(report.errors.len() as u64 <= report.failed);
        prop_assert!(report.errors.len() <= max_reported);
    }

    /// Property: progress stays within [0, 100] for any valid update
    #[test]
    fn progress_is_bounded(total in 0u64..10_000, processed_ratio in 0.0f64..=1.0, failed_ratio in 0.0f64..=1.0) {
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        let mut task = SyncTask::new(TaskKind::PushAll, 1, None, now);
        task.start(now).unwrap();
        task.set_total_items(total).unwrap();

        let processed = (total as f64 * processed_ratio).floor() as u64;
        let failed = (processed as f64 * failed_ratio).floor() as u64;
        task.update_progress(processed, processed - failed, failed, None).unwrap();

        prop_assert!((0.0..=100.0).contains(&task.progress_percentage));
        prop_assert!(task.update_progress(total + 1, 0, 0, None).is_err());
    }

    /// Property: no retry is ever granted at or past the attempt cap
    #[test]
    fn retries_stop_at_max_attempts(
        max_attempts in 1u32..8,
        attempt in 1u32..16,
        kind in error_kind_strategy(),
    ) {
        let policy = RetryPolicy::new(
            max_attempts,
            vec![Duration::from_secs(60), Duration::from_secs(180), Duration::from_secs(600)],
        );
        match policy.decide(attempt, kind) {
            RetryDecision::RetryAfter(delay) => {
                prop_assert!(attempt < max_attempts);
                prop_assert!(kind.is_retryable());
                prop_assert_eq!(delay, policy.delay_after(attempt));
            }
            RetryDecision::GiveUp => {
                prop_assert!(attempt >= max_attempts || !kind.is_retryable());
            }
        }
    }

    /// Property: a sorted backoff table yields non-decreasing delays, last entry repeating
    #[test]
    fn backoff_never_shrinks(mut table in prop::collection::vec(0u64..3_600, 1..6), attempt in 1u32..20) {
        table.sort_unstable();
        let last = *table.last().unwrap();
        let policy = RetryPolicy::new(10, table.into_iter().map(Duration::from_secs).collect());

        prop_assert!(policy.delay_after(attempt) <= policy.delay_after(attempt + 1));
        prop_assert!(policy.delay_after(attempt) <= Duration::from_secs(last));
    }
}
