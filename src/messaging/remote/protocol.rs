// src/messaging/remote/protocol.rs
// JSON frames exchanged with the remote messaging WebSocket endpoint

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command sent by the client. Every command carries a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ClientCommand {
    Subscribe {
        #[serde(rename = "messageId")]
        message_id: String,
        topic: String,
    },
    Unsubscribe {
        #[serde(rename = "messageId")]
        message_id: String,
        topic: String,
    },
    Publish {
        #[serde(rename = "messageId")]
        message_id: String,
        topic: String,
        message: Value,
    },
}

impl ClientCommand {
    pub fn message_id(&self) -> &str {
        match self {
            ClientCommand::Subscribe { message_id, .. }
            | ClientCommand::Unsubscribe { message_id, .. }
            | ClientCommand::Publish { message_id, .. } => message_id,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            ClientCommand::Subscribe { topic, .. }
            | ClientCommand::Unsubscribe { topic, .. }
            | ClientCommand::Publish { topic, .. } => topic,
        }
    }
}

/// Message published by another client and relayed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub topic: String,
    #[serde(default)]
    pub message: Value,
}

/// Frame sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Control message assigning the id to replay on the next connect
    SetClientId {
        #[serde(rename = "setClientId")]
        set_client_id: String,
    },
    Remote {
        #[serde(rename = "remoteMessage")]
        remote_message: RemoteMessage,
    },
    /// Correlated answer to a [`ClientCommand`]
    Response {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        error: bool,
        #[serde(default)]
        message: Option<String>,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unknown remote messaging frame");
                None
            }
        }
    }
}
