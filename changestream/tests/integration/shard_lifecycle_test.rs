use std::time::Duration;

use changestream::error::ErrorKind;
use changestream::merger::{MergerState, ParticipantState};
use changestream::options::ChangeStreamOptions;
use changestream::test_utils::cluster::{
    TestCluster, fast_config, shard, test_namespace, two_shard_cluster,
};
use changestream::test_utils::event::{
    assert_no_event, collect_events, document_ids, next_event, try_next_event,
};
use changestream::types::WatchScope;
use telemetry::tracing::init_test_tracing;

fn participant_state(
    states: &[(cluster::ShardId, ParticipantState)],
    id: &str,
) -> Option<ParticipantState> {
    states
        .iter()
        .find(|(shard_id, _)| shard_id == &shard(id))
        .map(|(_, state)| *state)
}

#[tokio::test(flavor = "multi_thread")]
async fn shard_removed_before_open_fails_unless_ignored() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();

    let start = test_cluster.cluster.write_noop(&shard("A")).unwrap();
    test_cluster.move_high_chunk("A");
    test_cluster.cluster.remove_shard(&shard("B")).unwrap();

    let err = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().start_at_time(start),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShardRemoved);
    assert_eq!(err.shard(), Some(&shard("B")));

    let mut stream = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new()
                .start_at_time(start)
                .ignore_removed_shards(true),
        )
        .await
        .unwrap();
    test_cluster.insert(2);

    let events = collect_events(&mut stream, 1).await;
    assert_eq!(document_ids(&events), vec![2]);
    assert_eq!(participant_state(&stream.participant_states(), "B"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn shard_removed_while_streaming_fails_after_earlier_events() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.insert(1);
    test_cluster.move_high_chunk("A");
    test_cluster.cluster.remove_shard(&shard("B")).unwrap();

    let event = next_event(&mut stream).await;
    assert_eq!(document_ids(&[event.clone()]), vec![1]);

    let err = try_next_event(&mut stream).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShardRemoved);
    assert_eq!(err.shard(), Some(&shard("B")));
    assert_eq!(err.last_token(), Some(&event.resume_token));
    assert!(stream.state().closed);
    assert!(!stream.state().requires_start_after);

    let err = stream.next(Duration::from_millis(10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CursorAlreadyClosed);
}

#[tokio::test(flavor = "multi_thread")]
async fn shard_removed_while_streaming_is_drained_when_ignored() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new().ignore_removed_shards(true),
        )
        .await
        .unwrap();

    test_cluster.insert(1);
    test_cluster.move_high_chunk("A");
    test_cluster.cluster.remove_shard(&shard("B")).unwrap();
    test_cluster.insert(2);

    let events = collect_events(&mut stream, 2).await;
    assert_eq!(document_ids(&events), vec![1, 2]);

    // The drained participant is dropped once its log is exhausted.
    assert!(stream.next(Duration::from_millis(100)).await.unwrap().is_none());
    assert_eq!(participant_state(&stream.participant_states(), "B"), None);
    assert_eq!(
        participant_state(&stream.participant_states(), "A"),
        Some(ParticipantState::Active)
    );
    assert!(!stream.state().closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_shard_holds_back_delivery_until_it_recovers() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.set_available("B", false);
    test_cluster.insert(-1);
    test_cluster.insert(1);

    // -1 is on A, but B may still hold an earlier event.
    assert_no_event(&mut stream, Duration::from_millis(300)).await;
    assert_eq!(stream.merger_state(), MergerState::AwaitingLowWaterMark);
    assert_eq!(
        participant_state(&stream.participant_states(), "B"),
        Some(ParticipantState::Lagging)
    );

    test_cluster.set_available("B", true);

    let events = collect_events(&mut stream, 2).await;
    assert_eq!(document_ids(&events), vec![-1, 1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_stream_fails_after_max_stall() {
    init_test_tracing();
    let mut config = fast_config();
    config.merger.max_stall_ms = Some(300);
    let test_cluster = TestCluster::with_config(&["A", "B"], config);
    test_cluster.shard_test_collection("A", "B");
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.set_available("B", false);
    test_cluster.insert(-1);

    let err = try_next_event(&mut stream).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamStalled);
    assert!(stream.state().closed);
}
