use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("api response is missing the expense id")]
    MissingId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Unreachable,
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct ExpenseClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl ExpenseClient {
    pub fn with_base_url(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetches one page of the full expense listing. Pages are 1-based.
    pub async fn list_expenses(&self, page: u32, limit: u32) -> Result<ExpensePage, ApiError> {
        let mut url = self.endpoint("/api/expenses")?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());
        let response = self.authorized(self.http.get(url)).send().await?;
        let body = Self::success_body(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Creates an expense and returns the id the server assigned to it.
    pub async fn create_expense(&self, expense: &ExpenseDto) -> Result<String, ApiError> {
        let url = self.endpoint("/api/expenses")?;
        let response = self
            .authorized(self.http.post(url))
            .json(expense)
            .send()
            .await?;
        let body = Self::success_body(response).await?;
        if body.trim().is_empty() {
            return Err(ApiError::MissingId);
        }
        let value: Value = serde_json::from_str(&body)?;
        created_id(&value).ok_or(ApiError::MissingId)
    }

    pub async fn update_expense(&self, remote_id: &str, expense: &ExpenseDto) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("/api/expenses/{remote_id}"))?;
        let response = self
            .authorized(self.http.put(url))
            .json(expense)
            .send()
            .await?;
        Self::success_body(response).await?;
        Ok(())
    }

    pub async fn delete_expense(&self, remote_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("/api/expenses/{remote_id}"))?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        Self::success_body(response).await?;
        Ok(())
    }

    pub async fn check_health(&self) -> Result<(), ApiError> {
        let url = self.endpoint("/api/health/lite")?;
        let response = self.http.get(url).send().await?;
        Self::success_body(response).await?;
        Ok(())
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn success_body(response: reqwest::Response) -> Result<String, ApiError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(ApiError::Api { status, body })
        }
    }
}

impl ApiError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            ApiError::Api { status, .. } => classify_api_status(*status),
            ApiError::Request(err) if err.is_connect() => ApiErrorClass::Unreachable,
            ApiError::Request(err) if err.is_builder() => ApiErrorClass::Permanent,
            ApiError::Request(_) | ApiError::MissingId => ApiErrorClass::Transient,
            ApiError::Url(_) | ApiError::Decode(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn is_unreachable(&self) -> bool {
        self.classification() == ApiErrorClass::Unreachable
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Extracts the server id from a raw listing item without parsing the rest.
pub fn remote_id_of(item: &Value) -> Option<String> {
    match item.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn created_id(value: &Value) -> Option<String> {
    remote_id_of(value).or_else(|| value.get("data").and_then(remote_id_of))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseDto {
    #[serde(
        default,
        deserialize_with = "deserialize_optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub expense_type: String,
    #[serde(default)]
    pub remark: Option<String>,
    pub amount: f64,
    pub date: String,
}

impl ExpenseDto {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// One page of `GET /api/expenses`. Items stay raw so that a single malformed
/// record can be skipped without losing the page.
#[derive(Debug, Deserialize, Serialize)]
pub struct ExpensePage {
    pub data: Vec<Value>,
    pub total: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number or string id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn remote_id_accepts_numbers_and_strings() {
        assert_eq!(remote_id_of(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(remote_id_of(&json!({"id": "r-1"})), Some("r-1".to_string()));
        assert_eq!(remote_id_of(&json!({"id": null})), None);
        assert_eq!(remote_id_of(&json!({"type": "食品"})), None);
    }

    #[test]
    fn created_id_reads_enveloped_response() {
        assert_eq!(
            created_id(&json!({"success": true, "data": {"id": 7}})),
            Some("7".to_string())
        );
    }

    #[test]
    fn dto_parses_numeric_id() {
        let dto = ExpenseDto::from_value(json!({
            "id": 12,
            "type": "餐饮",
            "remark": null,
            "amount": 18.5,
            "date": "2024-03-01"
        }))
        .unwrap();
        assert_eq!(dto.id.as_deref(), Some("12"));
        assert_eq!(dto.expense_type, "餐饮");
        assert_eq!(dto.amount, 18.5);
    }

    #[test]
    fn dto_rejects_missing_amount() {
        let result = ExpenseDto::from_value(json!({
            "id": 12,
            "type": "餐饮",
            "date": "2024-03-01"
        }));
        assert!(result.is_err());
    }
}
