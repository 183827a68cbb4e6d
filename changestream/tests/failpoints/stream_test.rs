use std::time::Duration;

use changestream::error::ErrorKind;
use changestream::failpoints::{SHARD_CURSOR__BEFORE_READ, TOPOLOGY__BEFORE_POLL};
use changestream::test_utils::cluster::two_shard_cluster;
use changestream::test_utils::event::{
    assert_no_event, collect_events, document_ids, try_next_event,
};
use changestream::test_utils::failpoints::CustomFailScenario;
use telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn transient_read_errors_are_retried() {
    init_test_tracing();
    let scenario = CustomFailScenario::setup(&[(SHARD_CURSOR__BEFORE_READ, "3*return(unavailable)")]);

    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;
    test_cluster.insert(-1);
    test_cluster.insert(1);

    let events = collect_events(&mut stream, 2).await;
    assert_eq!(document_ids(&events), vec![-1, 1]);
    assert!(!stream.state().closed);

    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_retryable_read_error_fails_the_stream() {
    init_test_tracing();
    let scenario = CustomFailScenario::setup(&[(SHARD_CURSOR__BEFORE_READ, "return(no_retry)")]);

    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;
    test_cluster.insert(1);

    let err = try_next_event(&mut stream).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WithNoRetry);
    assert!(err.shard().is_some());
    assert!(stream.state().closed);

    let err = stream.next(Duration::from_millis(10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CursorAlreadyClosed);

    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_topology_polls_hold_back_newer_events() {
    init_test_tracing();
    let scenario = CustomFailScenario::setup(&[(TOPOLOGY__BEFORE_POLL, "return(unavailable)")]);

    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;
    test_cluster.insert(-1);

    // The event is newer than the last known topology, so it waits for a successful poll.
    assert_no_event(&mut stream, Duration::from_millis(200)).await;

    scenario.disable(TOPOLOGY__BEFORE_POLL);
    let events = collect_events(&mut stream, 1).await;
    assert_eq!(document_ids(&events), vec![-1]);

    scenario.teardown();
}
