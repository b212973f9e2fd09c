// src/host/loader.rs
// Network side of head resources: what a browser does when a script/link is attached

use super::dom::ResourceKind;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Failure reported by a [`ResourceLoader`] (the element's `error` event)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLoadError {
    pub url: String,
    pub reason: String,
}

impl std::fmt::Display for ResourceLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loading {} failed: {}", self.url, self.reason)
    }
}

impl std::error::Error for ResourceLoadError {}

/// Loads the resource behind a head element.
///
/// Resolves once the element would have fired `load` (Ok) or `error` (Err).
/// Script loaders of native hosts register the bundle's launch functions in
/// the bootstrap registry before resolving.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, kind: ResourceKind, url: &str) -> Result<(), ResourceLoadError>;
}

/// Fetches resources over HTTP and treats any 2xx answer as loaded
pub struct HttpResourceLoader {
    client: reqwest::Client,
}

/// Per-resource request timeout
pub const RESOURCE_TIMEOUT: Duration = Duration::from_secs(60);

impl HttpResourceLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceLoader for HttpResourceLoader {
    async fn load(&self, kind: ResourceKind, url: &str) -> Result<(), ResourceLoadError> {
        let fail = |reason: String| ResourceLoadError {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .timeout(RESOURCE_TIMEOUT)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {}", status.as_u16())));
        }

        // Drain the body so the load completes like a browser fetch would
        let bytes = response.bytes().await.map_err(|e| fail(e.to_string()))?;
        debug!(url, kind = kind.as_str(), size = bytes.len(), "Resource loaded");
        Ok(())
    }
}
