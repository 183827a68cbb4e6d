use changestream::error::ErrorKind;
use changestream::options::ChangeStreamOptions;
use changestream::test_utils::cluster::{test_namespace, two_shard_cluster};
use changestream::test_utils::event::{collect_events, document_ids, operation_types};
use changestream::token::{ResumeToken, TokenVersion};
use changestream::types::{OperationType, WatchScope};
use cluster::{FeatureLevel, Namespace};
use serde_json::{Map, json};
use telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn baseline_feature_level_rejects_gated_options() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    test_cluster.cluster.set_feature_level(FeatureLevel::Baseline);
    let scope = WatchScope::collection(test_namespace());

    let err = test_cluster
        .open(
            scope.clone(),
            ChangeStreamOptions::new().ignore_removed_shards(true),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOption);

    let err = test_cluster
        .open(
            scope.clone(),
            ChangeStreamOptions::new().token_version(TokenVersion::V1),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOption);

    assert!(
        test_cluster
            .open(scope, ChangeStreamOptions::new().show_expanded_events(true))
            .await
            .is_ok()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_start_positions_are_rejected() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let now = test_cluster.insert(1);
    let mut stream = test_cluster.watch_collection().await;
    test_cluster.insert(2);
    let token = collect_events(&mut stream, 1).await.remove(0).resume_token;

    let err = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new()
                .resume_after(token.clone())
                .start_at_time(now),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOptions);

    let err = test_cluster
        .open(
            WatchScope::collection(test_namespace()),
            ChangeStreamOptions::new()
                .resume_after(token.clone())
                .start_after(token),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOptions);
}

#[tokio::test(flavor = "multi_thread")]
async fn control_databases_cannot_be_watched() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();

    for scope in [
        WatchScope::database("admin"),
        WatchScope::database(""),
        WatchScope::collection(Namespace::new("test", "")),
    ] {
        let err = test_cluster
            .open(scope, ChangeStreamOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn shape_id_depends_only_on_explicit_options() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let scope = WatchScope::collection(test_namespace());

    let first = test_cluster
        .open(scope.clone(), ChangeStreamOptions::new().show_expanded_events(true))
        .await
        .unwrap();
    let second = test_cluster
        .open(scope.clone(), ChangeStreamOptions::new().show_expanded_events(true))
        .await
        .unwrap();
    let implicit = test_cluster
        .open(scope.clone(), ChangeStreamOptions::new())
        .await
        .unwrap();
    let explicit_default = test_cluster
        .open(scope.clone(), ChangeStreamOptions::new().show_expanded_events(false))
        .await
        .unwrap();
    let database = test_cluster
        .open(WatchScope::database("test"), ChangeStreamOptions::new())
        .await
        .unwrap();

    assert_eq!(first.shape_id(), second.shape_id());
    assert_ne!(first.id(), second.id());
    assert_ne!(implicit.shape_id(), explicit_default.shape_id());
    assert_ne!(implicit.shape_id(), database.shape_id());

    let rendered = format!("{first:?}");
    assert!(rendered.starts_with("ChangeStream"));
    assert!(rendered.contains(&first.id().to_string()));
    assert!(rendered.contains(&first.shape_id().to_string()));

    // Start positions are not part of the shape.
    let started_at = test_cluster
        .open(
            scope,
            ChangeStreamOptions::new().start_at_time(test_cluster.cluster.cluster_time()),
        )
        .await
        .unwrap();
    assert_eq!(implicit.shape_id(), started_at.shape_id());
}

#[tokio::test(flavor = "multi_thread")]
async fn expanded_events_are_only_shown_on_request() {
    init_test_tracing();
    let test_cluster = two_shard_cluster();
    let scope = WatchScope::database("test");
    let mut plain = test_cluster
        .open(scope.clone(), ChangeStreamOptions::new())
        .await
        .unwrap();
    let mut expanded = test_cluster
        .open(scope, ChangeStreamOptions::new().show_expanded_events(true))
        .await
        .unwrap();

    let created = Namespace::new("test", "created");
    test_cluster.cluster.create_collection(&created).unwrap();
    test_cluster.insert(1);
    let mut set = Map::new();
    set.insert("size".to_owned(), json!(3));
    test_cluster
        .cluster
        .update(&test_namespace(), 1, set, vec![])
        .unwrap();

    let plain_events = collect_events(&mut plain, 2).await;
    assert_eq!(
        operation_types(&plain_events),
        vec![OperationType::Insert, OperationType::Update]
    );

    let expanded_events = collect_events(&mut expanded, 3).await;
    assert_eq!(
        operation_types(&expanded_events),
        vec![
            OperationType::Create,
            OperationType::Insert,
            OperationType::Update
        ]
    );
    assert_eq!(document_ids(&expanded_events[1..]), vec![1, 1]);

    let update = expanded_events[2].update_description.as_ref().unwrap();
    assert_eq!(update.updated_fields.get("size"), Some(&json!(3)));
    assert!(update.removed_fields.is_empty());
}

#[test]
fn unknown_options_and_malformed_tokens_are_rejected() {
    let err = serde_json::from_value::<ChangeStreamOptions>(json!({ "fullDocument": "updateLookup" }));
    assert!(err.is_err());

    let options = serde_json::from_value::<ChangeStreamOptions>(json!({
        "showExpandedEvents": true,
        "supportedEvents": ["retryNeeded"],
    }))
    .unwrap();
    assert!(options.expanded_events());
    assert!(options.wants_retry_needed());

    let err = ResumeToken::parse("not-a-token").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResumeToken);
}
