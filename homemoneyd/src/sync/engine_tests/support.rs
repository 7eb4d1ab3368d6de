use super::*;
use crate::sync::index::{Expense, ExpenseDraft};
use homemoney_core::ExpenseDto;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub(super) async fn make_engine(server: &MockServer) -> SyncEngine {
    make_engine_with(server, EngineConfig::default()).await
}

pub(super) async fn make_engine_with(server: &MockServer, config: EngineConfig) -> SyncEngine {
    let client = ExpenseClient::with_base_url(&server.uri(), Some("test-token".into())).unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();
    SyncEngine::new(client, store).with_config(config)
}

pub(super) fn draft(expense_type: &str, amount: f64) -> ExpenseDraft {
    ExpenseDraft {
        expense_type: expense_type.into(),
        remark: None,
        amount,
        date: "2024-04-01".into(),
    }
}

pub(super) fn server_item(id: i64, expense_type: &str, amount: f64) -> Value {
    json!({
        "id": id,
        "type": expense_type,
        "remark": null,
        "amount": amount,
        "date": "2024-04-01"
    })
}

/// Inserts a record that is already known to the server.
pub(super) async fn seed_synced(engine: &SyncEngine, remote_id: &str, amount: f64) -> Expense {
    let remote = ExpenseDto {
        id: Some(remote_id.into()),
        expense_type: "餐饮".into(),
        remark: None,
        amount,
        date: "2024-04-01".into(),
    };
    let expense = Expense::from_remote(remote_id.into(), &remote);
    engine.index().insert_expense(&expense).await.unwrap();
    expense
}

pub(super) async fn mount_listing(server: &MockServer, items: Vec<Value>) {
    let total = items.len();
    Mock::given(method("GET"))
        .and(path("/api/expenses"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": items,
            "total": total,
            "page": 1,
            "limit": 100
        })))
        .mount(server)
        .await;
}

/// Same as `make_engine`, also handing out the pool for direct queue edits.
pub(super) async fn make_engine_with_pool(server: &MockServer) -> (SyncEngine, sqlx::SqlitePool) {
    let client = ExpenseClient::with_base_url(&server.uri(), Some("test-token".into())).unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = IndexStore::from_pool(pool.clone());
    store.init().await.unwrap();
    (SyncEngine::new(client, store), pool)
}
