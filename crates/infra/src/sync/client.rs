//! External API client used by the incremental poller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::cursor_store::CURSOR_ORIGIN;
use super::mirror::RemoteRecord;

/// One page request: records with an id strictly greater than `after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub after: i64,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RemoteRecord>,
    pub has_more: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid API configuration: {0}")]
    Config(String),
}

/// Source of ordered remote records.
#[async_trait]
pub trait ExternalApi: Send + Sync {
    async fn get(&self, path: &str, request: PageRequest) -> Result<Page, ApiError>;
}

#[async_trait]
impl<T: ExternalApi + ?Sized> ExternalApi for Arc<T> {
    async fn get(&self, path: &str, request: PageRequest) -> Result<Page, ApiError> {
        (**self).get(path, request).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    /// Field of each record holding its integer identifier.
    pub id_field: String,
}

impl HttpApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(30),
            id_field: "id".to_string(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }
}

/// `ExternalApi` over HTTP.
///
/// Issues `GET {base_url}/{path}?after=<cursor>&page_size=<n>` and expects
/// `{"data": [...], "has_more": bool}`. When `has_more` is missing, a full
/// page means there may be more.
#[derive(Debug, Clone)]
pub struct HttpExternalApi {
    client: reqwest::Client,
    config: HttpApiConfig,
}

impl HttpExternalApi {
    pub fn new(config: HttpApiConfig) -> Result<Self, ApiError> {
        if config.base_url.trim().is_empty() {
            return Err(ApiError::Config("base_url must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpApiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ExternalApi for HttpExternalApi {
    async fn get(&self, path: &str, request: PageRequest) -> Result<Page, ApiError> {
        let mut req = self.client.get(self.url(path)).query(&[
            ("after", request.after.to_string()),
            ("page_size", request.page_size.to_string()),
        ]);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        parse_page(body, &self.config.id_field, request.page_size)
    }
}

fn parse_page(body: Value, id_field: &str, page_size: u32) -> Result<Page, ApiError> {
    let Value::Object(mut body) = body else {
        return Err(ApiError::Decode("response body is not an object".to_string()));
    };
    let data = match body.remove("data") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ApiError::Decode("`data` is not an array".to_string())),
        None => return Err(ApiError::Decode("missing `data` field".to_string())),
    };

    let records = data
        .into_iter()
        .map(|item| {
            let id = record_id(&item, id_field)?;
            Ok(RemoteRecord::new(id, item))
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let has_more = match body.get("has_more") {
        Some(Value::Bool(flag)) => *flag,
        _ => page_size > 0 && records.len() >= page_size as usize,
    };

    Ok(Page { records, has_more })
}

/// Integer id of a record. Numeric strings are accepted. Ids must sit above
/// [`CURSOR_ORIGIN`] or a sync from scratch would never mirror them.
fn record_id(item: &Value, id_field: &str) -> Result<i64, ApiError> {
    let id = match item.get(id_field) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ApiError::Decode(format!("`{id_field}` is not an integer: {n}"))),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map_err(|_| ApiError::Decode(format!("`{id_field}` is not an integer: {s:?}"))),
        Some(other) => Err(ApiError::Decode(format!(
            "`{id_field}` has unexpected type: {other}"
        ))),
        None => Err(ApiError::Decode(format!("record without `{id_field}` field"))),
    }?;
    if id <= CURSOR_ORIGIN {
        return Err(ApiError::Decode(format!(
            "`{id_field}` must be positive, got {id}"
        )));
    }
    Ok(id)
}
