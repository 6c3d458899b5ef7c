use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use lingua_types::api::{ApiResponse, CODE_OK};

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/v1".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Thin client over the backend's REST surface. Clones share the HTTP pool
/// and the bearer token.
#[derive(Clone)]
pub struct ApiClient {
    pub(crate) http: Client,
    base: Url,
    token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base: Url::parse(&config.base_url)?,
            token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Base url with `segments` appended, each percent-encoded.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends `req` with the bearer token and unwraps the response envelope.
    pub(crate) async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<Option<T>, ApiError> {
        let req = match self.token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req.send().await?;
        let status = resp.status();
        let url = resp.url().clone();
        let body = resp.text().await?;
        debug!("{} -> {}", url.path(), status);
        decode_envelope(status.as_u16(), &body)
    }

    pub(crate) async fn send_required<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        self.send(req).await?.ok_or(ApiError::MissingResult)
    }
}

/// Checks HTTP status and envelope `code`, returning the `result` payload.
pub(crate) fn decode_envelope<T: DeserializeOwned>(status: u16, body: &str) -> Result<Option<T>, ApiError> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<ApiResponse<Value>>(body)
            .ok()
            .and_then(|env| env.message)
            .unwrap_or_else(|| body.to_string());
        return Err(ApiError::Status { status, message });
    }
    let envelope: ApiResponse<T> = serde_json::from_str(body)?;
    if envelope.code != CODE_OK {
        return Err(ApiError::Rejected {
            code: envelope.code,
            message: envelope.message.unwrap_or_else(|| "request failed".to_string()),
        });
    }
    Ok(envelope.result)
}

/// Page results arrive as a bare array or wrapped in a page object.
pub(crate) fn page_items(result: Option<Value>) -> Vec<Value> {
    match result {
        Some(Value::Array(items)) => items,
        Some(Value::Object(mut page)) => ["content", "data", "items"]
            .iter()
            .find_map(|key| match page.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
