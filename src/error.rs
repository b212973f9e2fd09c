// src/error.rs
// Standardized error types for the portal runtime

use crate::rest::RestError;
use thiserror::Error;

/// Main error type for the portal runtime
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("app {plugin_name} with instance id {instance_id} is already loaded")]
    AppAlreadyLoaded {
        plugin_name: String,
        instance_id: String,
    },

    #[error("no loaded app with id {0}")]
    AppNotFound(String),

    #[error("no element with id {0} in the page")]
    AreaNotFound(String),

    #[error("modal overlay element not found in the page")]
    ModalOverlayMissing,

    #[error("no remote messaging connection available")]
    RemoteMessagingUnavailable,

    #[error("remote messaging connection not ready after {0} ms")]
    RemoteNotReady(u64),

    #[error("no response for remote command {0} within timeout")]
    RemoteTimeout(String),

    #[error("remote messaging error: {0}")]
    Remote(String),

    #[error("remote messaging connection closed")]
    Disconnected,

    #[error("REST error: {0}")]
    Rest(#[from] RestError),

    #[error("bootstrap of {plugin_name} failed: {message}")]
    Bootstrap {
        plugin_name: String,
        message: String,
    },

    #[error("launch function {0} is not registered")]
    LaunchFunctionMissing(String),

    #[error("plugin {0} is missing on the server")]
    PluginMissing(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Result using PortalError
pub type Result<T> = std::result::Result<T, PortalError>;

impl PortalError {
    /// Message shown in the app error placeholder
    pub fn to_user_string(&self) -> String {
        match self {
            PortalError::PluginMissing(name) => format!("App {} is not available", name),
            other => other.to_string(),
        }
    }
}

impl From<PortalError> for String {
    fn from(err: PortalError) -> Self {
        err.to_string()
    }
}
