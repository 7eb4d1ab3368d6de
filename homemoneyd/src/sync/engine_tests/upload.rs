use super::test_support::*;
use super::*;
use crate::sync::queue::{EntityType, ExpenseSnapshot};
use crate::sync::upload::group_by_record;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn empty_outbox_is_a_no_op() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;

    let first = engine.upload(&CancellationToken::new()).await.unwrap();
    let second = engine.upload(&CancellationToken::new()).await.unwrap();

    assert_eq!(first, UploadReport::default());
    assert_eq!(second, UploadReport::default());
}

#[tokio::test]
async fn create_attaches_remote_id_and_marks_synced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({"type": "餐饮", "amount": 12.0})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 501,
            "type": "餐饮",
            "remark": null,
            "amount": 12.0,
            "date": "2024-04-01"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    let expense = engine.index().create_local(&draft("餐饮", 12.0)).await.unwrap();

    let report = engine.upload(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.total, 1);
    assert_eq!(report.succeeded, 1);
    let stored = engine.index().get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.remote_id.as_deref(), Some("501"));
    assert_eq!(engine.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn create_precedes_update_of_same_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 77})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/expenses/77"))
        .and(body_partial_json(json!({"amount": 30.0})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 77})))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, pool) = make_engine_with_pool(&server).await;
    let expense = engine.index().create_local(&draft("交通", 10.0)).await.unwrap();
    let mut edited = expense.clone();
    edited.amount = 30.0;
    sqlx::query(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, data, retry_count, created_at)
         VALUES ('expense', ?1, 'UPDATE', ?2, 0, 0)",
    )
    .bind(&expense.local_id)
    .bind(edited.snapshot().to_json().unwrap())
    .execute(&pool)
    .await
    .unwrap();

    let report = engine.upload(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.succeeded, 2);
    let requests = server.received_requests().await.unwrap();
    let methods: Vec<_> = requests.iter().map(|r| r.method.to_string()).collect();
    assert_eq!(methods, vec!["POST", "PUT"]);
    let stored = engine.index().get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.remote_id.as_deref(), Some("77"));
}

#[tokio::test]
async fn update_without_remote_id_is_sent_as_create() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "abc"}})))
        .expect(1)
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    let expense = engine.index().create_local(&draft("餐饮", 1.0)).await.unwrap();
    let entry = engine.index().next_batch(1).await.unwrap().remove(0);
    engine.index().remove(entry.id).await.unwrap();
    engine
        .index()
        .enqueue(
            EntityType::Expense,
            &expense.local_id,
            SyncOperation::Update,
            &expense.snapshot().to_json().unwrap(),
        )
        .await
        .unwrap();

    engine.upload(&CancellationToken::new()).await.unwrap();

    let stored = engine.index().get_expense(&expense.local_id).await.unwrap().unwrap();
    assert_eq!(stored.remote_id.as_deref(), Some("abc"));
    assert!(stored.synced);
}

#[tokio::test]
async fn transient_failures_stop_after_retry_ceiling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    engine.index().create_local(&draft("餐饮", 1.0)).await.unwrap();

    for attempt in 1..=3u32 {
        let report = engine.upload(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(!report.failed_items[0].permanent);
        let entry = engine.index().next_batch(1).await.unwrap().remove(0);
        assert_eq!(entry.retry_count, attempt);
    }

    let report = engine.upload(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.failed_items[0].permanent);
    assert_eq!(engine.pending_count().await.unwrap(), 0);

    let report = engine.upload(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.total, 0);
}

#[tokio::test]
async fn validation_error_drops_entry_without_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(422).set_body_string("amount must be positive"))
        .expect(1)
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    let expense = engine.index().create_local(&draft("餐饮", -1.0)).await.unwrap();

    let report = engine.upload(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(report.failed_items[0].permanent);
    assert!(report.failed_items[0].error.contains("422"));
    assert_eq!(engine.pending_count().await.unwrap(), 0);
    let stored = engine.index().get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(!stored.synced);
}

#[tokio::test]
async fn unreadable_snapshot_is_dropped() {
    let server = MockServer::start().await;
    let engine = make_engine(&server).await;
    engine
        .index()
        .enqueue(EntityType::Expense, "L1", SyncOperation::Create, "{broken")
        .await
        .unwrap();

    let report = engine.upload(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(report.failed_items[0].permanent);
    assert_eq!(engine.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn entry_for_deleted_record_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    let snapshot = ExpenseSnapshot {
        local_id: "gone".into(),
        remote_id: None,
        expense_type: "餐饮".into(),
        remark: None,
        amount: 1.0,
        date: "2024-04-01".into(),
    };
    engine
        .index()
        .enqueue(
            EntityType::Expense,
            "gone",
            SyncOperation::Create,
            &snapshot.to_json().unwrap(),
        )
        .await
        .unwrap();

    let report = engine.upload(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(engine.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn delete_uses_snapshot_remote_id_and_tolerates_404() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/expenses/R1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/expenses/R2"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    let first = seed_synced(&engine, "R1", 1.0).await;
    let second = seed_synced(&engine, "R2", 2.0).await;
    engine.index().delete_local(&first.local_id).await.unwrap();
    engine.index().delete_local(&second.local_id).await.unwrap();

    let report = engine.upload(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(engine.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn unreachable_server_aborts_phase_and_keeps_entries() {
    let client = ExpenseClient::with_base_url("http://127.0.0.1:1", None).unwrap();
    let server = MockServer::start().await;
    let seeded = make_engine(&server).await;
    seeded.index().create_local(&draft("餐饮", 1.0)).await.unwrap();
    let engine = SyncEngine::new(client, seeded.index().clone());

    let err = engine.upload(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Unreachable(_)));
    let entry = engine.index().next_batch(1).await.unwrap().remove(0);
    assert_eq!(entry.retry_count, 0);
}

#[tokio::test]
async fn auth_failure_aborts_phase() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    engine.index().create_local(&draft("餐饮", 1.0)).await.unwrap();

    let err = engine.upload(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert_eq!(engine.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn failed_entry_defers_rest_of_its_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, pool) = make_engine_with_pool(&server).await;
    let expense = engine.index().create_local(&draft("餐饮", 1.0)).await.unwrap();
    sqlx::query(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, data, retry_count, created_at)
         VALUES ('expense', ?1, 'UPDATE', ?2, 0, 0)",
    )
    .bind(&expense.local_id)
    .bind(expense.snapshot().to_json().unwrap())
    .execute(&pool)
    .await
    .unwrap();

    let report = engine.upload(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 1);
    let batch = engine.index().next_batch(10).await.unwrap();
    assert_eq!(batch[0].retry_count, 1);
    assert_eq!(batch[1].retry_count, 0);
}

#[tokio::test]
async fn cancelled_upload_leaves_entry_intact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"id": 1}))
                .set_delay(std::time::Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    let engine = make_engine(&server).await;
    let expense = engine.index().create_local(&draft("餐饮", 1.0)).await.unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = engine.upload(&cancel).await.unwrap_err();

    assert!(matches!(err, EngineError::Cancelled));
    let entry = engine.index().next_batch(1).await.unwrap().remove(0);
    assert_eq!(entry.local_id, expense.local_id);
    assert_eq!(entry.retry_count, 0);
    let stored = engine.index().get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(stored.remote_id.is_none());
}

#[test]
fn grouping_keeps_queue_order() {
    let entry = |id: i64, local: &str| crate::sync::queue::OutboxEntry {
        id,
        entity_type: EntityType::Expense,
        local_id: local.into(),
        operation: SyncOperation::Update,
        payload: "{}".into(),
        retry_count: 0,
        created_at: 0,
    };
    let groups = group_by_record(vec![
        entry(1, "A"),
        entry(2, "B"),
        entry(3, "A"),
        entry(4, "C"),
        entry(5, "B"),
    ]);
    let ids: Vec<Vec<i64>> = groups
        .iter()
        .map(|g| g.iter().map(|e| e.id).collect())
        .collect();
    assert_eq!(ids, vec![vec![1, 3], vec![2, 5], vec![4]]);
}
