use std::time::Duration;

use changestream::error::ErrorKind;
use changestream::options::ChangeStreamOptions;
use changestream::test_utils::cluster::{shard, test_namespace, two_shard_cluster};
use changestream::test_utils::event::{
    assert_no_event, collect_events, document_ids, try_next_event,
};
use changestream::token::ResumeTokenCodec;
use changestream::types::WatchScope;
use cluster::Namespace;
use serde_json::json;
use telemetry::tracing::init_test_tracing;
use tokio::time::Instant;

#[tokio::test(flavor = "multi_thread")]
async fn resume_after_continues_past_the_given_event() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.insert(1);
    test_cluster.insert(-1);
    test_cluster.insert(2);

    let events = collect_events(&mut stream, 3).await;
    assert_eq!(document_ids(&events), vec![1, -1, 2]);
    drop(stream);

    let mut resumed = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().resume_after(events[0].resume_token.clone()),
        )
        .await
        .unwrap();

    let resumed_events = collect_events(&mut resumed, 2).await;
    assert_eq!(resumed_events, events[1..].to_vec());
    assert_no_event(&mut resumed, Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_token_advances_without_events_in_scope() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;
    let initial = stream.resume_token();

    let other = Namespace::new("test", "other");
    let written_at = test_cluster.cluster.insert(&other, json!({ "_id": 1 })).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(stream.next(Duration::from_millis(100)).await.unwrap().is_none());
        if stream.resume_token().position().cluster_time >= written_at {
            break;
        }
        assert!(Instant::now() < deadline, "resume token did not advance");
    }

    let advanced = stream.resume_token();
    assert!(ResumeTokenCodec::compare(initial.data(), advanced.data()).is_lt());
    assert!(!advanced.is_from_invalidate());
    assert!(stream.state().last_token.is_none());
    drop(stream);

    let mut resumed = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().resume_after(advanced),
        )
        .await
        .unwrap();
    test_cluster.insert(3);

    let events = collect_events(&mut resumed, 1).await;
    assert_eq!(document_ids(&events), vec![3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_at_time_includes_events_at_that_time() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();

    test_cluster.insert(1);
    let second = test_cluster.insert(-2);
    test_cluster.insert(3);

    let mut stream = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().start_at_time(second),
        )
        .await
        .unwrap();

    let events = collect_events(&mut stream, 2).await;
    assert_eq!(document_ids(&events), vec![-2, 3]);
    assert_eq!(events[0].cluster_time, second);
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_history_fails_the_stream() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();

    let first = test_cluster.insert(-1);
    let truncated = test_cluster.insert(-2);
    test_cluster
        .cluster
        .truncate_log(&shard("A"), truncated)
        .unwrap();

    let result = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().start_at_time(first),
        )
        .await;

    // The loss is detected either when the cursors are opened or on their first read.
    let err = match result {
        Ok(mut stream) => {
            let err = try_next_event(&mut stream).await.unwrap_err();
            assert!(stream.state().closed);
            err
        }
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::ChangeStreamHistoryLost);
    assert_eq!(err.shard(), Some(&shard("A")));
}
