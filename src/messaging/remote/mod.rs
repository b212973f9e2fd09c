// src/messaging/remote/mod.rs
// Server-relayed messaging over a WebSocket connection

pub mod client;
pub mod protocol;

pub use client::{CLIENT_ID_STORAGE_KEY, ConnectionState, RemoteMessageHandler, RemoteMessagingClient};
pub use protocol::{ClientCommand, RemoteMessage, ServerMessage};
