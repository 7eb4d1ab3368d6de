use homemoney_core::{ApiErrorClass, ExpenseClient, ExpenseDto};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn lunch() -> ExpenseDto {
    ExpenseDto {
        id: None,
        expense_type: "餐饮".to_string(),
        remark: Some("lunch".to_string()),
        amount: 32.0,
        date: "2024-05-01".to_string(),
    }
}

#[tokio::test]
async fn list_expenses_sends_bearer_and_paging() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/expenses"))
        .and(query_param("page", "2"))
        .and(query_param("limit", "100"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": 1, "type": "餐饮", "remark": null, "amount": 10.0, "date": "2024-05-01"},
                {"id": "x", "broken": true}
            ],
            "total": 102,
            "page": 2,
            "limit": 100
        })))
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), Some("test-token".into())).unwrap();
    let page = client.list_expenses(2, 100).await.unwrap();

    assert_eq!(page.total, 102);
    assert_eq!(page.page, 2);
    assert_eq!(page.data.len(), 2);
    assert!(ExpenseDto::from_value(page.data[1].clone()).is_err());
}

#[tokio::test]
async fn list_expenses_rejects_unexpected_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), None).unwrap();
    let err = client.list_expenses(1, 100).await.unwrap_err();

    assert_eq!(err.classification(), ApiErrorClass::Permanent);
}

#[tokio::test]
async fn create_expense_returns_server_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .and(body_json(json!({
            "type": "餐饮",
            "remark": "lunch",
            "amount": 32.0,
            "date": "2024-05-01"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 501,
            "type": "餐饮",
            "remark": "lunch",
            "amount": 32.0,
            "date": "2024-05-01"
        })))
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), None).unwrap();
    let id = client.create_expense(&lunch()).await.unwrap();

    assert_eq!(id, "501");
}

#[tokio::test]
async fn create_expense_without_id_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/expenses"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), None).unwrap();
    let err = client.create_expense(&lunch()).await.unwrap_err();

    assert!(err.is_retryable());
}

#[tokio::test]
async fn update_expense_uses_put_on_remote_id() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/expenses/77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 77})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), None).unwrap();
    client.update_expense("77", &lunch()).await.unwrap();
}

#[tokio::test]
async fn delete_expense_accepts_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/expenses/9"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), Some("test-token".into())).unwrap();
    client.delete_expense("9").await.unwrap();
}

#[tokio::test]
async fn delete_expense_reports_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/expenses/9"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), None).unwrap();
    let err = client.delete_expense("9").await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.classification(), ApiErrorClass::Permanent);
}

#[tokio::test]
async fn errors_are_classified_by_status() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/expenses/1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/expenses/2"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/expenses/3"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), None).unwrap();

    let auth = client.update_expense("1", &lunch()).await.unwrap_err();
    assert_eq!(auth.classification(), ApiErrorClass::Auth);
    assert!(!auth.is_retryable());

    let unavailable = client.update_expense("2", &lunch()).await.unwrap_err();
    assert_eq!(unavailable.classification(), ApiErrorClass::Transient);

    let limited = client.update_expense("3", &lunch()).await.unwrap_err();
    assert_eq!(limited.classification(), ApiErrorClass::RateLimit);
    assert!(limited.is_retryable());
}

#[tokio::test]
async fn health_check_reaches_lite_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/health/lite"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ExpenseClient::with_base_url(&server.uri(), None).unwrap();
    client.check_health().await.unwrap();
}

#[tokio::test]
async fn refused_connection_is_unreachable() {
    let client = ExpenseClient::with_base_url("http://127.0.0.1:1", None).unwrap();
    let err = client.check_health().await.unwrap_err();

    assert!(err.is_unreachable());
}
