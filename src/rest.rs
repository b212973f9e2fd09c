// src/rest.rs
// Thin JSON REST client with CSRF header injection and typed errors

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Header carrying the CSRF token of the page
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Failed REST call. `status` is 0 when no HTTP response was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (status {status})")]
pub struct RestError {
    pub status: u16,
    pub message: String,
}

impl RestError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        self.status == 0
    }
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        RestError::new(err.status().map(|s| s.as_u16()).unwrap_or(0), err.to_string())
    }
}

/// REST client bound to a base path
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_path: String,
    csrf_token: Option<String>,
}

impl RestClient {
    pub fn new(http: reqwest::Client, base_path: impl Into<String>, csrf_token: Option<String>) -> Self {
        Self {
            http,
            base_path: base_path.into().trim_end_matches('/').to_string(),
            csrf_token,
        }
    }

    /// Same client for another base path (e.g. an app's REST proxy path)
    pub fn with_base_path(&self, base_path: impl Into<String>) -> Self {
        Self::new(self.http.clone(), base_path, self.csrf_token.clone())
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RestError> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, RestError> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, RestError> {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), RestError> {
        self.send::<(), ()>(Method::DELETE, path, None).await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, RestError> {
        let url = format!("{}{}", self.base_path, path);
        debug!(%method, url = %url, "REST request");

        let mut request = self
            .http
            .request(method, &url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.csrf_token {
            request = request.header(CSRF_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(RestError::new(status.as_u16(), error_message(&text, status)));
        }

        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| RestError::new(status.as_u16(), format!("invalid JSON response: {}", e)))
    }
}

/// Prefer the `message` field of a JSON error body, then the raw body
fn error_message(body: &str, status: reqwest::StatusCode) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = json.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.to_string()
    }
}
