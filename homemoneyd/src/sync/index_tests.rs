use super::*;
use sqlx::sqlite::SqlitePoolOptions;

async fn make_store() -> IndexStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn draft(amount: f64) -> ExpenseDraft {
    ExpenseDraft {
        expense_type: "餐饮".into(),
        remark: Some("lunch".into()),
        amount,
        date: "2024-03-01".into(),
    }
}

fn remote(id: &str, amount: f64) -> ExpenseDto {
    ExpenseDto {
        id: Some(id.into()),
        expense_type: "餐饮".into(),
        remark: None,
        amount,
        date: "2024-03-02".into(),
    }
}

#[tokio::test]
async fn insert_and_fetch_expense() {
    let store = make_store().await;
    let expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));

    store.insert_expense(&expense).await.unwrap();

    let by_local = store.get_expense(&expense.local_id).await.unwrap();
    let by_remote = store.get_expense_by_remote_id("R1").await.unwrap();
    assert_eq!(by_local.as_ref(), Some(&expense));
    assert_eq!(by_remote, Some(expense));
}

#[tokio::test]
async fn synced_record_requires_remote_id() {
    let store = make_store().await;
    let mut expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));
    expense.remote_id = None;

    let err = store.insert_expense(&expense).await.unwrap_err();
    assert!(matches!(err, IndexError::SyncedWithoutRemoteId(_)));
}

#[tokio::test]
async fn schema_rejects_synced_without_remote_id() {
    let store = make_store().await;
    let result = sqlx::query(
        "INSERT INTO expenses (id, server_id, is_synced, type, remark, amount, date)
         VALUES ('L1', NULL, 1, 'x', NULL, 1.0, '2024-01-01')",
    )
    .execute(&store.pool)
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn update_and_delete_report_missing_records() {
    let store = make_store().await;
    let mut expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));
    assert!(!store.update_expense(&expense).await.unwrap());

    store.insert_expense(&expense).await.unwrap();
    expense.amount = 11.0;
    assert!(store.update_expense(&expense).await.unwrap());
    assert_eq!(
        store.get_expense(&expense.local_id).await.unwrap().unwrap().amount,
        11.0
    );

    assert!(store.delete_expense(&expense.local_id).await.unwrap());
    assert!(!store.delete_expense(&expense.local_id).await.unwrap());
}

#[tokio::test]
async fn create_local_queues_create() {
    let store = make_store().await;
    let expense = store.create_local(&draft(20.0)).await.unwrap();

    assert!(!expense.synced);
    assert!(expense.remote_id.is_none());
    let batch = store.next_batch(100).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].operation, SyncOperation::Create);
    assert_eq!(batch[0].local_id, expense.local_id);
    assert_eq!(batch[0].retry_count, 0);
    let snapshot = ExpenseSnapshot::from_json(&batch[0].payload).unwrap();
    assert_eq!(snapshot.amount, 20.0);
}

#[tokio::test]
async fn update_local_coalesces_into_pending_create() {
    let store = make_store().await;
    let expense = store.create_local(&draft(20.0)).await.unwrap();
    let other = store.create_local(&draft(5.0)).await.unwrap();

    let updated = store
        .update_local(&expense.local_id, &draft(25.0))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.amount, 25.0);
    let batch = store.next_batch(100).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].local_id, expense.local_id);
    assert_eq!(batch[0].operation, SyncOperation::Create);
    assert_eq!(
        ExpenseSnapshot::from_json(&batch[0].payload).unwrap().amount,
        25.0
    );
    assert_eq!(batch[1].local_id, other.local_id);
}

#[tokio::test]
async fn update_local_on_missing_record_is_none() {
    let store = make_store().await;
    assert!(
        store
            .update_local("missing", &draft(1.0))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn update_of_synced_record_queues_update_and_clears_flag() {
    let store = make_store().await;
    let expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));
    store.insert_expense(&expense).await.unwrap();

    store
        .update_local(&expense.local_id, &draft(10.0))
        .await
        .unwrap();

    let stored = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(!stored.synced);
    assert_eq!(stored.remote_id.as_deref(), Some("R1"));
    let batch = store.next_batch(100).await.unwrap();
    assert_eq!(batch[0].operation, SyncOperation::Update);
}

#[tokio::test]
async fn delete_local_of_unuploaded_record_leaves_no_trace() {
    let store = make_store().await;
    let expense = store.create_local(&draft(20.0)).await.unwrap();

    assert!(store.delete_local(&expense.local_id).await.unwrap());

    assert!(store.get_expense(&expense.local_id).await.unwrap().is_none());
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn delete_local_of_uploaded_record_queues_delete_with_remote_id() {
    let store = make_store().await;
    let expense = Expense::from_remote("R7".into(), &remote("R7", 9.0));
    store.insert_expense(&expense).await.unwrap();
    store
        .update_local(&expense.local_id, &draft(10.0))
        .await
        .unwrap();

    assert!(store.delete_local(&expense.local_id).await.unwrap());

    let batch = store.next_batch(100).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].operation, SyncOperation::Delete);
    let snapshot = ExpenseSnapshot::from_json(&batch[0].payload).unwrap();
    assert_eq!(snapshot.remote_id.as_deref(), Some("R7"));
}

#[tokio::test]
async fn next_batch_is_fifo_and_limited() {
    let store = make_store().await;
    for i in 0..5 {
        store
            .enqueue(
                EntityType::Expense,
                &format!("L{i}"),
                SyncOperation::Create,
                "{}",
            )
            .await
            .unwrap();
    }

    let batch = store.next_batch(3).await.unwrap();
    let ids: Vec<_> = batch.iter().map(|e| e.local_id.as_str()).collect();
    assert_eq!(ids, vec!["L0", "L1", "L2"]);
    assert_eq!(store.pending_count().await.unwrap(), 5);
}

#[tokio::test]
async fn update_after_delete_is_not_coalesced() {
    let store = make_store().await;
    store
        .enqueue(EntityType::Expense, "L1", SyncOperation::Delete, "{}")
        .await
        .unwrap();
    store
        .enqueue(EntityType::Expense, "L1", SyncOperation::Update, "{}")
        .await
        .unwrap();
    assert_eq!(store.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn increment_retry_returns_new_count() {
    let store = make_store().await;
    let id = store
        .enqueue(EntityType::Expense, "L1", SyncOperation::Create, "{}")
        .await
        .unwrap();

    assert_eq!(store.increment_retry(id).await.unwrap(), Some(1));
    assert_eq!(store.increment_retry(id).await.unwrap(), Some(2));
    assert!(store.remove(id).await.unwrap());
    assert_eq!(store.increment_retry(id).await.unwrap(), None);
}

#[tokio::test]
async fn complete_upload_attaches_remote_id_and_marks_synced() {
    let store = make_store().await;
    let expense = store.create_local(&draft(20.0)).await.unwrap();
    let entry = store.next_batch(1).await.unwrap().remove(0);

    let synced = store.complete_upload(&entry, Some("R1")).await.unwrap();

    assert!(synced);
    let stored = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.remote_id.as_deref(), Some("R1"));
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn complete_upload_keeps_entry_edited_in_flight() {
    let store = make_store().await;
    let expense = store.create_local(&draft(20.0)).await.unwrap();
    let sent = store.next_batch(1).await.unwrap().remove(0);
    store
        .update_local(&expense.local_id, &draft(30.0))
        .await
        .unwrap();

    let synced = store.complete_upload(&sent, Some("R1")).await.unwrap();

    assert!(!synced);
    let stored = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(!stored.synced);
    assert_eq!(stored.remote_id.as_deref(), Some("R1"));
    let batch = store.next_batch(100).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, sent.id);
    assert_eq!(batch[0].operation, SyncOperation::Update);
}

#[tokio::test]
async fn complete_upload_leaves_flag_when_other_entries_pending() {
    let store = make_store().await;
    let expense = store.create_local(&draft(20.0)).await.unwrap();
    let create = store.next_batch(1).await.unwrap().remove(0);
    store
        .enqueue(
            EntityType::Expense,
            &expense.local_id,
            SyncOperation::Delete,
            "{}",
        )
        .await
        .unwrap();

    assert!(!store.complete_upload(&create, Some("R1")).await.unwrap());
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn complete_upload_for_deleted_record_queues_remote_delete() {
    let store = make_store().await;
    let expense = store.create_local(&draft(20.0)).await.unwrap();
    let sent = store.next_batch(1).await.unwrap().remove(0);
    store.delete_local(&expense.local_id).await.unwrap();

    assert!(!store.complete_upload(&sent, Some("R9")).await.unwrap());

    let batch = store.next_batch(100).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].operation, SyncOperation::Delete);
    let snapshot = ExpenseSnapshot::from_json(&batch[0].payload).unwrap();
    assert_eq!(snapshot.remote_id.as_deref(), Some("R9"));
}

#[tokio::test]
async fn accept_server_copy_drops_local_changes() {
    let store = make_store().await;
    let expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));
    store.insert_expense(&expense).await.unwrap();
    store
        .update_local(&expense.local_id, &draft(99.0))
        .await
        .unwrap();

    assert!(
        store
            .accept_server_copy(&expense.local_id, "R1", &remote("R1", 12.0))
            .await
            .unwrap()
    );

    let stored = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.amount, 12.0);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn server_overwrite_applies_to_synced_record() {
    let store = make_store().await;
    let expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));
    store.insert_expense(&expense).await.unwrap();

    assert!(
        store
            .overwrite_synced_expense(&expense.local_id, &remote("R1", 30.0))
            .await
            .unwrap()
    );

    let stored = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.amount, 30.0);
}

#[tokio::test]
async fn server_overwrite_skips_record_edited_after_it_was_read() {
    let store = make_store().await;
    let expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));
    store.insert_expense(&expense).await.unwrap();
    let read_before_edit = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(read_before_edit.synced);
    store
        .update_local(&expense.local_id, &draft(42.0))
        .await
        .unwrap();

    assert!(
        !store
            .overwrite_synced_expense(&read_before_edit.local_id, &remote("R1", 30.0))
            .await
            .unwrap()
    );

    let stored = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    assert!(!stored.synced);
    assert_eq!(stored.amount, 42.0);
    let batch = store.next_batch(100).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(
        ExpenseSnapshot::from_json(&batch[0].payload).unwrap().amount,
        42.0
    );
}

#[tokio::test]
async fn requeue_uses_payload_current_at_write_time() {
    let store = make_store().await;
    let expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));
    store.insert_expense(&expense).await.unwrap();
    store
        .update_local(&expense.local_id, &draft(10.0))
        .await
        .unwrap();
    let read_before_edit = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    store
        .update_local(&expense.local_id, &draft(11.0))
        .await
        .unwrap();

    let queued = store
        .requeue_unsynced(&read_before_edit.local_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(queued.amount, 11.0);
    let batch = store.next_batch(100).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].operation, SyncOperation::Update);
    assert_eq!(batch[0].payload, queued.snapshot().to_json().unwrap());

    // the queued payload is what actually gets marked synced after upload
    assert!(
        store
            .complete_upload(&batch[0], None)
            .await
            .unwrap()
    );
    let stored = store.get_expense(&expense.local_id).await.unwrap().unwrap();
    assert_eq!(stored.amount, 11.0);
}

#[tokio::test]
async fn requeue_skips_synced_or_missing_record() {
    let store = make_store().await;
    let expense = Expense::from_remote("R1".into(), &remote("R1", 9.0));
    store.insert_expense(&expense).await.unwrap();

    assert!(store.requeue_unsynced(&expense.local_id).await.unwrap().is_none());
    assert!(store.requeue_unsynced("missing").await.unwrap().is_none());
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn list_synced_skips_unsynced_records() {
    let store = make_store().await;
    store
        .insert_expense(&Expense::from_remote("R1".into(), &remote("R1", 1.0)))
        .await
        .unwrap();
    store.create_local(&draft(2.0)).await.unwrap();

    assert_eq!(store.list_expenses().await.unwrap().len(), 2);
    let synced = store.list_synced_expenses().await.unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].remote_id.as_deref(), Some("R1"));
}

#[tokio::test]
async fn last_sync_round_trips() {
    let store = make_store().await;
    assert_eq!(store.last_sync_millis().await.unwrap(), None);
    store.set_last_sync_millis(1_700_000_000_000).await.unwrap();
    store.set_last_sync_millis(1_700_000_000_500).await.unwrap();
    assert_eq!(
        store.last_sync_millis().await.unwrap(),
        Some(1_700_000_000_500)
    );
}

#[tokio::test]
async fn open_creates_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sync.db");

    let store = IndexStore::open(&path).await.unwrap();
    store.create_local(&draft(1.0)).await.unwrap();
    drop(store);

    let reopened = IndexStore::open(&path).await.unwrap();
    assert_eq!(reopened.pending_count().await.unwrap(), 1);
}
