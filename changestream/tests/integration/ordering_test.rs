use std::time::Duration;

use changestream::options::ChangeStreamOptions;
use changestream::test_utils::cluster::{TestCluster, shard, test_namespace, two_shard_cluster};
use changestream::test_utils::event::{
    assert_no_event, assert_strictly_increasing, collect_events, document_ids, operation_types,
};
use changestream::types::{OperationType, WatchScope};
use cluster::{LogicalTimestamp, WriteOp};
use serde_json::json;
use telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn events_from_two_shards_are_delivered_in_cluster_time_order() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.insert(-1);
    test_cluster.insert(1);

    let events = collect_events(&mut stream, 2).await;
    assert_eq!(document_ids(&events), vec![-1, 1]);
    assert_eq!(
        operation_types(&events),
        vec![OperationType::Insert, OperationType::Insert]
    );
    assert_strictly_increasing(&events);
    assert_eq!(events[1].full_document, Some(json!({ "_id": 1 })));
}

#[tokio::test(flavor = "multi_thread")]
async fn safe_migration_neither_loses_nor_duplicates_events() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    test_cluster.insert(1);
    test_cluster.insert(2);
    // Both documents are copied to A and deleted from B by the migration.
    test_cluster.move_high_chunk("A");
    test_cluster.insert(3);

    let events = collect_events(&mut stream, 3).await;
    assert_eq!(document_ids(&events), vec![1, 2, 3]);
    assert_strictly_increasing(&events);
    assert_no_event(&mut stream, Duration::from_millis(100)).await;

    assert_eq!(
        test_cluster.cluster.owning_shard(&test_namespace(), 3).unwrap(),
        shard("A")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn transaction_entries_are_ordered_by_txn_index() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    let insert = |id: i64| WriteOp::Insert {
        namespace: test_namespace(),
        document: json!({ "_id": id }),
    };
    let committed_at = test_cluster
        .cluster
        .transaction(vec![insert(-5), insert(5), insert(-6)])
        .unwrap();

    let events = collect_events(&mut stream, 3).await;
    assert_eq!(document_ids(&events), vec![-5, 5, -6]);
    assert!(events.iter().all(|event| event.cluster_time == committed_at));
    assert_eq!(
        events.iter().map(|event| event.txn_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_strictly_increasing(&events);
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_histories_produce_identical_output() {
    init_test_tracing();

    async fn run() -> String {
        let test_cluster = two_shard_cluster();
        test_cluster.insert(-3);
        test_cluster.insert(4);
        test_cluster.insert(-2);
        test_cluster.move_high_chunk("A");
        test_cluster.insert(7);

        let mut stream = test_cluster
            .open(
                WatchScope::collection(test_namespace()),
                ChangeStreamOptions::new().start_at_time(LogicalTimestamp::MIN),
            )
            .await
            .unwrap();
        let events = collect_events(&mut stream, 4).await;

        serde_json::to_string(&events).unwrap()
    }

    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_leaves_cursor_state_untouched() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let mut stream = test_cluster.watch_collection().await;

    let before = stream.state().clone();
    assert!(stream.next(Duration::from_millis(30)).await.unwrap().is_none());
    assert!(stream.next(Duration::from_millis(30)).await.unwrap().is_none());
    assert_eq!(stream.state(), &before);

    test_cluster.insert(-4);
    let events = collect_events(&mut stream, 1).await;
    assert_eq!(document_ids(&events), vec![-4]);
    assert_eq!(stream.state().last_token.as_ref(), Some(&events[0].resume_token));
}

#[tokio::test(flavor = "multi_thread")]
async fn database_scope_merges_collections() {
    init_test_tracing();
    let test_cluster = TestCluster::new(&["A", "B"]);
    test_cluster.shard_test_collection("A", "B");
    let other = cluster::Namespace::new("test", "other");
    test_cluster.cluster.create_collection(&other).unwrap();

    let mut stream = test_cluster
        .open(WatchScope::database("test"), ChangeStreamOptions::new())
        .await
        .unwrap();

    test_cluster.insert(1);
    test_cluster.cluster.insert(&other, json!({ "_id": 10 })).unwrap();
    test_cluster.insert(-1);

    let events = collect_events(&mut stream, 3).await;
    assert_eq!(document_ids(&events), vec![1, 10, -1]);
    assert_eq!(
        events[1].namespace.as_ref().and_then(|ns| ns.coll.as_deref()),
        Some("other")
    );
    assert_strictly_increasing(&events);
}
