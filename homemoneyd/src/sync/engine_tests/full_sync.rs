use super::test_support::*;
use super::*;
use crate::sync::conflict::ConflictResolution;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn local_create_round_trips_through_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;
    mount_listing(&server, vec![server_item(1, "餐饮", 12.0)]).await;
    let engine = make_engine(&server).await;
    let created = engine.index().create_local(&draft("餐饮", 12.0)).await.unwrap();

    let report = engine.perform_full_sync().await.unwrap();

    assert_eq!(report.upload.succeeded, 1);
    assert_eq!(report.download.new, 0);
    assert_eq!(report.download.updated, 0);
    assert!(!report.has_conflicts());
    let all = engine.index().list_expenses().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].local_id, created.local_id);
    assert_eq!(all[0].remote_id.as_deref(), Some("1"));
    assert!(all[0].synced);
    assert_eq!(engine.pending_count().await.unwrap(), 0);
    assert_eq!(engine.status(), SyncStatus::Success);
    assert!(engine.last_sync_time().await.unwrap().is_some());
}

#[tokio::test]
async fn status_moves_through_syncing() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![]).await;
    let engine = make_engine(&server).await;
    let mut status = engine.observe_status();
    assert_eq!(*status.borrow_and_update(), SyncStatus::Idle);

    engine.perform_full_sync().await.unwrap();

    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), SyncStatus::Success);
}

#[tokio::test]
async fn conflicts_end_in_conflict_status() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/expenses/7"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    mount_listing(&server, vec![server_item(7, "餐饮", 99.0)]).await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "7", 10.0).await;
    engine
        .index()
        .update_local(&seeded.local_id, &draft("餐饮", 42.0))
        .await
        .unwrap();

    let report = engine.perform_full_sync().await.unwrap();

    assert_eq!(report.upload.failed, 1);
    assert!(report.has_conflicts());
    assert_eq!(engine.status(), SyncStatus::Conflict);
    assert!(engine.last_sync_time().await.unwrap().is_some());
}

#[tokio::test]
async fn failed_download_keeps_last_sync_time() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    engine.index().set_last_sync_millis(1_000).await.unwrap();

    let err = engine.perform_full_sync().await.unwrap_err();

    assert!(matches!(err, EngineError::Api(_)));
    assert_eq!(engine.status(), SyncStatus::Failed);
    assert_eq!(engine.last_sync_time().await.unwrap(), Some(1_000));
}

#[tokio::test]
async fn unreachable_server_fails_the_run() {
    let client = ExpenseClient::with_base_url("http://127.0.0.1:1", None).unwrap();
    let server = MockServer::start().await;
    let seeded = make_engine(&server).await;
    seeded.index().create_local(&draft("餐饮", 1.0)).await.unwrap();
    let engine = SyncEngine::new(client, seeded.index().clone());

    let err = engine.perform_full_sync().await.unwrap_err();

    assert!(matches!(err, EngineError::Unreachable(_)));
    assert_eq!(engine.status(), SyncStatus::Failed);
    assert_eq!(engine.pending_count().await.unwrap(), 1);
    assert_eq!(engine.last_sync_time().await.unwrap(), None);
}

#[tokio::test]
async fn cancelled_run_is_reported_as_failed() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![]).await;
    let engine = make_engine(&server).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine.perform_full_sync_with(&cancel).await.unwrap_err();

    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(engine.status(), SyncStatus::Failed);
    assert_eq!(engine.last_sync_time().await.unwrap(), None);
}

#[tokio::test]
async fn use_local_resolution_queues_local_copy() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(7, "餐饮", 99.0)]).await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "7", 10.0).await;
    engine
        .index()
        .update_local(&seeded.local_id, &draft("餐饮", 42.0))
        .await
        .unwrap();
    let report = engine.download(&CancellationToken::new()).await.unwrap();
    let entry_id = engine.index().next_batch(1).await.unwrap()[0].id;
    engine.index().remove(entry_id).await.unwrap();

    let resolved = engine.resolve_conflicts(&report.conflicts).await.unwrap();

    assert_eq!(resolved, 1);
    let queued = engine.index().next_batch(10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].operation, SyncOperation::Update);
    assert!(queued[0].payload.contains("42"));
}

#[tokio::test]
async fn use_server_resolution_overwrites_local_copy() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(7, "交通", 99.0)]).await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "7", 10.0).await;
    engine
        .index()
        .update_local(&seeded.local_id, &draft("餐饮", 42.0))
        .await
        .unwrap();
    let report = engine.download(&CancellationToken::new()).await.unwrap();
    let conflicts: Vec<_> = report
        .conflicts
        .into_iter()
        .map(|c| c.with_resolution(ConflictResolution::UseServer))
        .collect();

    let resolved = engine.resolve_conflicts(&conflicts).await.unwrap();

    assert_eq!(resolved, 1);
    let stored = engine.index().get_expense(&seeded.local_id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.amount, 99.0);
    assert_eq!(stored.expense_type, "交通");
    assert_eq!(engine.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn merge_resolution_is_not_applied() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(7, "餐饮", 99.0)]).await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "7", 10.0).await;
    engine
        .index()
        .update_local(&seeded.local_id, &draft("餐饮", 42.0))
        .await
        .unwrap();
    let report = engine.download(&CancellationToken::new()).await.unwrap();
    let conflicts: Vec<_> = report
        .conflicts
        .into_iter()
        .map(|c| c.with_resolution(ConflictResolution::Merge))
        .collect();

    let resolved = engine.resolve_conflicts(&conflicts).await.unwrap();

    assert_eq!(resolved, 0);
    let stored = engine.index().get_expense(&seeded.local_id).await.unwrap().unwrap();
    assert_eq!(stored.amount, 42.0);
    assert!(!stored.synced);
}

#[tokio::test]
async fn resolving_a_vanished_record_is_a_no_op() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![server_item(7, "餐饮", 99.0)]).await;
    let engine = make_engine(&server).await;
    let seeded = seed_synced(&engine, "7", 10.0).await;
    engine
        .index()
        .update_local(&seeded.local_id, &draft("餐饮", 42.0))
        .await
        .unwrap();
    let report = engine.download(&CancellationToken::new()).await.unwrap();
    engine.index().delete_local(&seeded.local_id).await.unwrap();

    let resolved = engine.resolve_conflicts(&report.conflicts).await.unwrap();

    assert_eq!(resolved, 0);
}
