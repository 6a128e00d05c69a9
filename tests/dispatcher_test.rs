//! Enqueue, deduplication, queue selection and worker shutdown.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{start_time, test_config, wait_for_terminal, Harness};
use erp_sync_core::config::DuplicatePolicy;
use erp_sync_core::error::{ErrorKind, SyncError};
use erp_sync_core::models::{CatalogEntity, TaskKind, TaskQueue};
use erp_sync_core::orchestration::{EnqueueDisposition, EnqueueRequest, TaskDispatcher};
use erp_sync_core::state_machine::TaskState;

async fn wait_for_pushes(harness: &Harness, expected: u32) {
    for _ in 0..500 {
        if harness.adapter.push_calls() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("adapter never reached {expected} pushes");
}

#[tokio::test]
async fn test_duplicate_enqueue_attaches_to_in_flight_task() {
    let (harness, gate) = Harness::gated(test_config());
    harness.add_connection(1).await;
    harness.seed_entities(1);
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let request = EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(1);
    let first = dispatcher.enqueue(request.clone()).await.expect("enqueue");
    assert_eq!(first.disposition, EnqueueDisposition::Enqueued);
    wait_for_pushes(&harness, 1).await;

    let second = dispatcher.enqueue(request.clone()).await.expect("enqueue");
    assert_eq!(second.disposition, EnqueueDisposition::Attached);
    assert_eq!(second.task_id, first.task_id);

    gate.add_permits(1);
    let view = wait_for_terminal(&dispatcher, first.task_id).await;
    assert_eq!(view.status, TaskState::Completed);
    assert_eq!(harness.adapter.push_calls(), 1);

    // Once the first run is over the key is free again
    gate.add_permits(1);
    let third = dispatcher.enqueue(request).await.expect("enqueue");
    assert_eq!(third.disposition, EnqueueDisposition::Enqueued);
    assert_ne!(third.task_id, first.task_id);
    wait_for_terminal(&dispatcher, third.task_id).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_enqueue_rejected_under_reject_policy() {
    let mut config = test_config();
    config.executor.duplicate_policy = DuplicatePolicy::Reject;
    let (harness, gate) = Harness::gated(config);
    harness.add_connection(1).await;
    harness.seed_entities(1);
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let request = EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(1);
    let first = dispatcher.enqueue(request.clone()).await.expect("enqueue");

    let error = dispatcher.enqueue(request).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::DuplicateInFlight);
    match error {
        SyncError::DuplicateInFlight { existing, key } => {
            assert_eq!(existing, first.task_id);
            assert!(key.contains("push_one"));
        }
        other => panic!("expected a duplicate rejection, got {other:?}"),
    }

    gate.add_permits(1);
    wait_for_terminal(&dispatcher, first.task_id).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_different_entities_run_side_by_side() {
    let (harness, gate) = Harness::gated(test_config());
    harness.add_connection(1).await;
    harness.seed_entities(2);
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let a = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(1))
        .await
        .expect("enqueue");
    let b = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(2))
        .await
        .expect("enqueue");
    assert_eq!(b.disposition, EnqueueDisposition::Enqueued);
    assert_ne!(a.task_id, b.task_id);

    wait_for_pushes(&harness, 2).await;
    gate.add_permits(2);
    assert_eq!(
        wait_for_terminal(&dispatcher, a.task_id).await.status,
        TaskState::Completed
    );
    assert_eq!(
        wait_for_terminal(&dispatcher, b.task_id).await.status,
        TaskState::Completed
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn test_important_entities_use_the_high_queue() {
    let harness = Harness::new();
    harness.add_connection(1).await;
    harness.seed_entities(2);
    harness.catalog.insert(
        CatalogEntity::new(2, "SKU-2", start_time())
            .with_field("name", json!("Flagship"))
            .important(),
    );
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let normal = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(1))
        .await
        .expect("enqueue");
    let important = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(2))
        .await
        .expect("enqueue");
    let bulk = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushAll, 1))
        .await
        .expect("enqueue");
    let forced = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PullAll, 1).on_queue(TaskQueue::High))
        .await
        .expect("enqueue");

    assert_eq!(normal.queue, TaskQueue::Default);
    assert_eq!(important.queue, TaskQueue::High);
    assert_eq!(bulk.queue, TaskQueue::Default);
    assert_eq!(forced.queue, TaskQueue::High);

    for receipt in [normal, important, bulk, forced] {
        wait_for_terminal(&dispatcher, receipt.task_id).await;
        assert_eq!(harness.task(receipt.task_id).await.queue, receipt.queue);
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn test_high_queue_is_drained_first() {
    let mut config = test_config();
    config.executor.max_concurrent_tasks = 1;
    let (harness, gate) = Harness::gated(config);
    harness.add_connection(1).await;
    harness.seed_entities(3);
    harness
        .catalog
        .insert(
            CatalogEntity::new(3, "SKU-3", start_time())
                .with_field("name", json!("Urgent"))
                .important(),
        );
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let blocker = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(1))
        .await
        .expect("enqueue");
    wait_for_pushes(&harness, 1).await;

    let waiting = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(2))
        .await
        .expect("enqueue");
    let urgent = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(3))
        .await
        .expect("enqueue");
    assert_eq!(urgent.queue, TaskQueue::High);

    // Queued keys stay claimed, so only the blocker's status is awaited here
    gate.add_permits(1);
    wait_for_pushes(&harness, 2).await;
    assert_eq!(
        dispatcher.get_task(blocker.task_id).await.expect("status").status,
        TaskState::Completed
    );

    assert_eq!(
        dispatcher.get_task(urgent.task_id).await.expect("status").status,
        TaskState::Running
    );
    assert_eq!(
        dispatcher.get_task(waiting.task_id).await.expect("status").status,
        TaskState::Pending
    );

    gate.add_permits(2);
    wait_for_terminal(&dispatcher, waiting.task_id).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_enqueue_validates_requests() {
    let harness = Harness::new();
    harness.add_connection(1).await;
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let missing_entity = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1))
        .await
        .unwrap_err();
    assert!(matches!(missing_entity, SyncError::Validation(_)));

    let mut options = erp_sync_core::models::SyncOptions::fields(&["price", "price"]);
    options.sync_stock = true;
    let duplicate_fields = dispatcher
        .enqueue(
            EnqueueRequest::new(TaskKind::PushOne, 1)
                .for_entity(1)
                .with_options(options),
        )
        .await
        .unwrap_err();
    assert_eq!(duplicate_fields.kind(), ErrorKind::Validation);

    assert_eq!(harness.executor.idempotency().in_flight_count(), 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_direct_execution_of_duplicate_fails_it() {
    let (harness, gate) = Harness::gated(test_config());
    harness.add_connection(1).await;
    harness.seed_entities(1);
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let running = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(1))
        .await
        .expect("enqueue");
    wait_for_pushes(&harness, 1).await;

    let twin = harness.new_task(TaskKind::PushOne, 1, Some(1));
    harness.store.tasks.insert(&twin).await.expect("insert");
    let refused = harness.executor.execute(twin.task_id).await.expect("execute");

    assert_eq!(refused.status, TaskState::Failed);
    assert_eq!(refused.error_kind, Some(ErrorKind::DuplicateInFlight));
    assert_eq!(harness.adapter.push_calls(), 1);

    gate.add_permits(1);
    let view = wait_for_terminal(&dispatcher, running.task_id).await;
    assert_eq!(view.status, TaskState::Completed);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_status_of_unknown_task() {
    let harness = Harness::new();
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let unknown = uuid::Uuid::new_v4();
    let error = dispatcher.get_task(unknown).await.unwrap_err();
    assert!(matches!(error, SyncError::TaskNotFound(id) if id == unknown));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_status_view_reports_result() {
    let harness = Harness::new();
    harness.add_connection(1).await;
    harness.seed_entities(1);
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    let receipt = dispatcher
        .enqueue(
            EnqueueRequest::new(TaskKind::PushOne, 1)
                .for_entity(1)
                .triggered_by("ops@example.com"),
        )
        .await
        .expect("enqueue");
    let view = wait_for_terminal(&dispatcher, receipt.task_id).await;

    assert_eq!(view.kind, TaskKind::PushOne);
    assert_eq!(view.progress_percentage, 100.0);
    assert!(view.result_summary.is_some());
    assert!(view.error_kind.is_none());
    assert_eq!(
        harness.task(receipt.task_id).await.triggered_by.as_deref(),
        Some("ops@example.com")
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn test_enqueue_after_shutdown_is_refused() {
    let harness = Harness::new();
    harness.add_connection(1).await;
    harness.seed_entities(1);
    let (dispatcher, handle) =
        TaskDispatcher::start(Arc::clone(&harness.executor), &harness.config.executor);

    handle.shutdown().await;

    let error = dispatcher
        .enqueue(EnqueueRequest::new(TaskKind::PushOne, 1).for_entity(1))
        .await
        .unwrap_err();
    assert!(matches!(error, SyncError::DispatcherClosed(_)));
    assert_eq!(harness.executor.idempotency().in_flight_count(), 0);

    // The persisted task is closed out instead of waiting forever
    assert!(harness.rows.tasks_in_state(TaskState::Pending).is_empty());
    let failed = harness.rows.tasks_in_state(TaskState::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_kind, Some(ErrorKind::Internal));
    assert_eq!(failed[0].entity_id, Some(1));
}
