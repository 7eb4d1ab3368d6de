use super::test_support::*;
use super::*;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn unknown_server_records_are_inserted_as_synced() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        vec![server_item(1, "餐饮", 12.5), server_item(2, "交通", 3.0)],
    )
    .await;
    let engine = make_engine(&server).await;

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.new, 2);
    let stored = engine.index().get_expense_by_remote_id("2").await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.expense_type, "交通");
    assert_eq!(stored.amount, 3.0);
    assert_eq!(engine.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn changed_synced_record_takes_server_copy() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(7, "餐饮", 99.0)]).await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "7", 10.0).await;

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.new, 0);
    let stored = engine.index().get_expense(&seeded.local_id).await.unwrap().unwrap();
    assert_eq!(stored.amount, 99.0);
    assert!(stored.synced);
}

#[tokio::test]
async fn identical_record_is_left_alone() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(7, "餐饮", 10.0)]).await;
    let engine = make_engine(&server).await;
    seed_synced(&engine, "7", 10.0).await;

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.new, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(engine.index().list_expenses().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unsynced_local_edit_wins_and_is_reported() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(7, "餐饮", 99.0)]).await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "7", 10.0).await;
    let edited = engine
        .index()
        .update_local(&seeded.local_id, &draft("餐饮", 42.0))
        .await
        .unwrap()
        .unwrap();

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.requeued, 1);
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.local_id, seeded.local_id);
    assert_eq!(conflict.remote_id, "7");
    assert_eq!(conflict.local.amount, 42.0);
    assert_eq!(conflict.server.amount, 99.0);

    let stored = engine.index().get_expense(&seeded.local_id).await.unwrap().unwrap();
    assert_eq!(stored.amount, 42.0);
    assert!(!stored.synced);
    let queued = engine.index().next_batch(10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].operation, SyncOperation::Update);
    assert_eq!(queued[0].payload, edited.snapshot().to_json().unwrap());
}

#[tokio::test]
async fn unsynced_record_matching_server_is_requeued_without_conflict() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(7, "餐饮", 42.0)]).await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "7", 10.0).await;
    engine
        .index()
        .update_local(&seeded.local_id, &draft("餐饮", 42.0))
        .await
        .unwrap();

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.requeued, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(engine.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn synced_records_missing_on_server_are_removed() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(2, "餐饮", 2.0)]).await;
    let engine = make_engine(&server).await;
    let gone = seed_synced(&engine, "1", 1.0).await;
    let kept = seed_synced(&engine, "2", 2.0).await;
    let edited = seed_synced(&engine, "3", 3.0).await;
    engine
        .index()
        .update_local(&edited.local_id, &draft("餐饮", 4.0))
        .await
        .unwrap();
    let fresh = engine.index().create_local(&draft("餐饮", 5.0)).await.unwrap();

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.deleted, 1);
    let index = engine.index();
    assert!(index.get_expense(&gone.local_id).await.unwrap().is_none());
    assert!(index.get_expense(&kept.local_id).await.unwrap().is_some());
    assert!(index.get_expense(&edited.local_id).await.unwrap().is_some());
    assert!(index.get_expense(&fresh.local_id).await.unwrap().is_some());
}

#[tokio::test]
async fn malformed_server_record_keeps_local_copy() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        vec![json!({"id": 5, "amount": "not a number"}), json!({"type": "餐饮"})],
    )
    .await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "5", 5.0).await;

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.skipped, 2);
    assert_eq!(report.deleted, 0);
    let stored = engine.index().get_expense(&seeded.local_id).await.unwrap().unwrap();
    assert_eq!(stored.amount, 5.0);
}

#[tokio::test]
async fn listing_is_read_page_by_page() {
    let server = MockServer::start().await;
    let page = |number: u32, items: Vec<serde_json::Value>| {
        Mock::given(method("GET"))
            .and(path("/api/expenses"))
            .and(query_param("page", number.to_string()))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": items,
                "total": 5,
                "page": number,
                "limit": 2
            })))
            .expect(1)
    };
    page(1, vec![server_item(1, "餐饮", 1.0), server_item(2, "餐饮", 2.0)])
        .mount(&server)
        .await;
    page(2, vec![server_item(3, "餐饮", 3.0), server_item(4, "餐饮", 4.0)])
        .mount(&server)
        .await;
    page(3, vec![server_item(5, "餐饮", 5.0)]).mount(&server).await;
    let engine = make_engine_with(
        &server,
        EngineConfig {
            download_page_size: 2,
            ..EngineConfig::default()
        },
    )
    .await;

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.fetched, 5);
    assert_eq!(report.new, 5);
    assert_eq!(engine.index().list_expenses().await.unwrap().len(), 5);
}

#[tokio::test]
async fn empty_page_ends_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/expenses"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [],
            "total": 40,
            "page": 1,
            "limit": 100
        })))
        .expect(1)
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    seed_synced(&engine, "9", 9.0).await;

    let report = engine.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.fetched, 0);
    assert_eq!(report.deleted, 1);
}

#[tokio::test]
async fn failed_page_aborts_without_deleting() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "9", 9.0).await;

    let err = engine.download(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Api(_)));
    assert!(engine.index().get_expense(&seeded.local_id).await.unwrap().is_some());
}

#[tokio::test]
async fn rejected_credentials_abort_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;

    let err = engine.download(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Unauthorized(_)));
}
