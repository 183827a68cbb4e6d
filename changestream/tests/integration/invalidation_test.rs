use std::time::Duration;

use changestream::error::ErrorKind;
use changestream::merger::MergerState;
use changestream::options::ChangeStreamOptions;
use changestream::test_utils::cluster::{TestCluster, test_namespace, two_shard_cluster};
use changestream::test_utils::event::{
    EVENT_TIMEOUT, assert_no_event, collect_until_terminal, document_ids, next_event,
    operation_types,
};
use changestream::types::{EventNamespace, OperationType, WatchScope};
use futures::StreamExt;
use telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn migration_to_new_shard_invalidates_and_start_after_continues() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.insert(-1);
    test_cluster.move_high_chunk("C");
    test_cluster.insert(2);

    let events = collect_until_terminal(&mut stream).await;
    assert_eq!(
        operation_types(&events),
        vec![OperationType::Insert, OperationType::Invalidate]
    );
    assert_eq!(document_ids(&events), vec![-1]);

    let invalidate = &events[1];
    assert!(invalidate.resume_token.is_from_invalidate());
    assert_eq!(
        invalidate.namespace,
        Some(EventNamespace::from(&test_namespace()))
    );
    assert!(stream.state().closed);
    assert!(stream.state().requires_start_after);
    assert_eq!(stream.merger_state(), MergerState::Closed);
    assert_eq!(stream.resume_token(), invalidate.resume_token);

    let err = stream.next(Duration::from_millis(10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CursorAlreadyClosed);

    // The token of an invalidate can never continue the old stream.
    let err = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().resume_after(invalidate.resume_token.clone()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidResumeToken);
    assert_eq!(err.code(), 3);

    let mut reopened = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().start_after(invalidate.resume_token.clone()),
        )
        .await
        .unwrap();
    let event = next_event(&mut reopened).await;
    assert_eq!(document_ids(&[event]), vec![2]);
    assert_no_event(&mut reopened, Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_needed_replaces_invalidate_when_supported() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().supported_events(vec![OperationType::RetryNeeded]),
        )
        .await
        .unwrap();

    test_cluster.insert(1);
    test_cluster.move_high_chunk("C");

    let events = collect_until_terminal(&mut stream).await;
    assert_eq!(
        operation_types(&events),
        vec![OperationType::Insert, OperationType::RetryNeeded]
    );
    assert!(events[1].resume_token.is_from_invalidate());
    assert!(stream.state().requires_start_after);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_collection_invalidates_once() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.insert(-1);
    test_cluster.insert(1);
    let dropped_at = test_cluster.cluster.drop_collection(&test_namespace()).unwrap();

    let events = collect_until_terminal(&mut stream).await;
    // The drop is logged by both shards, only the first one is reported.
    assert_eq!(
        operation_types(&events),
        vec![
            OperationType::Insert,
            OperationType::Insert,
            OperationType::Drop,
            OperationType::Invalidate
        ]
    );
    assert_eq!(events[2].cluster_time, dropped_at);
    assert_eq!(events[3].cluster_time, dropped_at);
    assert!(events[3].resume_token.is_from_invalidate());
    assert!(!events[2].resume_token.is_from_invalidate());
}

#[tokio::test(flavor = "multi_thread")]
async fn resuming_after_the_drop_only_reports_the_invalidate() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.insert(-1);
    test_cluster.insert(1);
    let dropped_at = test_cluster.cluster.drop_collection(&test_namespace()).unwrap();

    let events = collect_until_terminal(&mut stream).await;
    assert_eq!(events[2].operation_type, OperationType::Drop);
    let invalidate = &events[3];

    let mut resumed = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().resume_after(events[2].resume_token.clone()),
        )
        .await
        .unwrap();
    let resumed_events = collect_until_terminal(&mut resumed).await;

    // The second shard's copy of the drop must not be reported again.
    assert_eq!(operation_types(&resumed_events), vec![OperationType::Invalidate]);
    assert_eq!(resumed_events[0].cluster_time, dropped_at);
    assert_eq!(resumed_events[0].resume_token, invalidate.resume_token);
    assert!(resumed.state().requires_start_after);
    assert_eq!(resumed.merger_state(), MergerState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn resuming_after_an_insert_before_the_drop_reports_the_drop_once() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.insert(-1);
    test_cluster.insert(1);
    test_cluster.cluster.drop_collection(&test_namespace()).unwrap();
    let events = collect_until_terminal(&mut stream).await;

    let mut resumed = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().resume_after(events[1].resume_token.clone()),
        )
        .await
        .unwrap();
    let resumed_events = collect_until_terminal(&mut resumed).await;
    assert_eq!(
        operation_types(&resumed_events),
        vec![OperationType::Drop, OperationType::Invalidate]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_database_invalidates_database_stream() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster
        .open(WatchScope::database("test"), ChangeStreamOptions::new())
        .await
        .unwrap();

    test_cluster.insert(1);
    test_cluster.cluster.drop_database("test").unwrap();

    let events = collect_until_terminal(&mut stream).await;
    assert_eq!(
        operation_types(&events),
        vec![
            OperationType::Insert,
            OperationType::Drop,
            OperationType::Drop,
            OperationType::DropDatabase,
            OperationType::Invalidate
        ]
    );
    assert_eq!(events[4].namespace, Some(EventNamespace::database("test")));
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_stream_survives_drops() {
    init_test_tracing();
    let test_cluster = TestCluster::new(&["A", "B"]);
    test_cluster.shard_test_collection("A", "B");
    let mut stream = test_cluster
        .open(WatchScope::Cluster, ChangeStreamOptions::new())
        .await
        .unwrap();

    test_cluster.cluster.drop_collection(&test_namespace()).unwrap();
    test_cluster.insert(5);

    let drop_a = next_event(&mut stream).await;
    let drop_b = next_event(&mut stream).await;
    let insert = next_event(&mut stream).await;
    assert_eq!(drop_a.operation_type, OperationType::Drop);
    assert_eq!(drop_b.operation_type, OperationType::Drop);
    assert_eq!(insert.operation_type, OperationType::Insert);
    assert!(!stream.state().closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_interrupts_a_waiting_next() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    let canceller = stream.canceller();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = stream.next(Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(stream.state().closed);
    assert_eq!(stream.merger_state(), MergerState::Closed);

    let err = stream.next(Duration::from_millis(10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn event_stream_ends_after_the_terminal_event() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let stream = test_cluster.watch_collection().await;

    test_cluster.insert(-1);
    test_cluster.insert(1);
    test_cluster.move_high_chunk("C");

    let events = stream
        .into_stream(Duration::from_millis(50))
        .map(|event| event.unwrap())
        .collect::<Vec<_>>();
    let events = tokio::time::timeout(EVENT_TIMEOUT, events).await.unwrap();

    assert_eq!(
        operation_types(&events),
        vec![
            OperationType::Insert,
            OperationType::Insert,
            OperationType::Invalidate
        ]
    );
}
