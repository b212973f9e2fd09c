// src/messaging/remote/client.rs
// WebSocket client with command correlation, readiness wait and reconnect

use super::protocol::{ClientCommand, ServerMessage};
use crate::config::ClientConfig;
use crate::error::{PortalError, Result};
use crate::host::Storage;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session storage key of the server-assigned client id
pub const CLIENT_ID_STORAGE_KEY: &str = "portal-remote-messaging-client-id";

/// Connection state machine:
/// disconnected -> connecting -> connected -> closed -> reconnecting -> connecting.
/// `Terminated` is final (retry budget exhausted or client closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Reconnecting,
    Terminated,
}

/// Receives `(topic, message)` of every relayed remote message
pub type RemoteMessageHandler = Arc<dyn Fn(String, Value) + Send + Sync>;

struct PendingCommand {
    tx: oneshot::Sender<Result<()>>,
    deadline: Instant,
}

struct Inner {
    connect_url: String,
    config: ClientConfig,
    session_storage: Arc<dyn Storage>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, PendingCommand>>,
    /// Server-side topics with an acknowledged subscription, in subscribe order
    subscriptions: Mutex<Vec<String>>,
    handler: Mutex<Option<RemoteMessageHandler>>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// Client of the server's remote messaging endpoint
#[derive(Clone)]
pub struct RemoteMessagingClient {
    inner: Arc<Inner>,
}

impl RemoteMessagingClient {
    pub fn new(connect_url: impl Into<String>, session_storage: Arc<dyn Storage>, config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connect_url: connect_url.into(),
                config,
                session_storage,
                state,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_message_handler(&self, handler: RemoteMessageHandler) {
        *self.inner.handler.lock() = Some(handler);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.session_storage.get_item(CLIENT_ID_STORAGE_KEY)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().clone()
    }

    /// Start connecting. Commands call this implicitly.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move { client.run_connection().await });
        let client = self.clone();
        tokio::spawn(async move { client.run_timeout_sweep().await });
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.send_command(ClientCommand::Subscribe {
            message_id,
            topic: topic.to_string(),
        })
        .await?;
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.inner.subscriptions.lock().retain(|t| t != topic);
        let message_id = uuid::Uuid::new_v4().to_string();
        self.send_command(ClientCommand::Unsubscribe {
            message_id,
            topic: topic.to_string(),
        })
        .await
    }

    pub async fn publish(&self, topic: &str, message: Value) -> Result<()> {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.send_command(ClientCommand::Publish {
            message_id,
            topic: topic.to_string(),
            message,
        })
        .await
    }

    /// Stop for good: no further reconnects, outstanding commands fail
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.set_state(ConnectionState::Terminated);
        self.fail_pending(|| PortalError::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Remote messaging state changed");
        }
    }

    async fn send_command(&self, command: ClientCommand) -> Result<()> {
        self.start();
        let outbound = self.wait_until_ready().await?;

        let message_id = command.message_id().to_string();
        let json = serde_json::to_string(&command)?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            message_id.clone(),
            PendingCommand {
                tx,
                deadline: Instant::now() + self.inner.config.remote_command_timeout(),
            },
        );

        if outbound.send(Message::Text(json.into())).is_err() {
            self.inner.pending.lock().remove(&message_id);
            return Err(PortalError::Disconnected);
        }
        debug!(message_id = %message_id, topic = command.topic(), "Remote command sent");

        rx.await.unwrap_or(Err(PortalError::Disconnected))
    }

    /// Poll the connection until it is usable or the readiness timeout elapses
    async fn wait_until_ready(&self) -> Result<mpsc::UnboundedSender<Message>> {
        let timeout = self.inner.config.remote_ready_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            match self.connection_state() {
                ConnectionState::Connected => {
                    if let Some(tx) = self.inner.outbound.lock().clone() {
                        return Ok(tx);
                    }
                }
                ConnectionState::Terminated => return Err(PortalError::Disconnected),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(PortalError::RemoteNotReady(timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.inner.config.remote_ready_check_interval()).await;
        }
    }

    fn connect_url(&self) -> String {
        let Some(client_id) = self.client_id() else {
            return self.inner.connect_url.clone();
        };
        match url::Url::parse(&self.inner.connect_url) {
            Ok(mut url) => {
                let others: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != "clientId")
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                url.query_pairs_mut()
                    .clear()
                    .extend_pairs(others)
                    .append_pair("clientId", &client_id);
                url.to_string()
            }
            Err(e) => {
                warn!(error = %e, "Invalid remote messaging URL, connecting without client id");
                self.inner.connect_url.clone()
            }
        }
    }

    async fn run_connection(&self) {
        let shutdown = self.inner.shutdown.clone();
        let mut attempt: u32 = 0;
        let mut was_connected = false;

        loop {
            self.set_state(ConnectionState::Connecting);
            let url = self.connect_url();
            debug!(url = %url, attempt, "Connecting remote messaging");

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    attempt = 0;
                    info!("Remote messaging connected");
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    *self.inner.outbound.lock() = Some(outbound_tx);
                    self.set_state(ConnectionState::Connected);

                    if was_connected {
                        self.resubscribe();
                    }
                    was_connected = true;

                    let closed_by_us = self.pump(ws, outbound_rx).await;
                    *self.inner.outbound.lock() = None;
                    self.fail_pending(|| PortalError::Disconnected);
                    if closed_by_us {
                        break;
                    }
                    self.set_state(ConnectionState::Closed);
                    warn!("Remote messaging connection closed unexpectedly");
                }
                Err(e) => {
                    warn!(error = %e, "Remote messaging connect failed");
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            attempt += 1;
            if attempt > self.inner.config.reconnect_max_attempts {
                error!(
                    attempts = attempt - 1,
                    "Remote messaging reconnect budget exhausted, giving up"
                );
                self.set_state(ConnectionState::Terminated);
                self.fail_pending(|| PortalError::Disconnected);
                return;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.inner.config.reconnect_delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting remote messaging");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Terminated);
    }

    /// Shuttle frames until the socket closes. Returns true on intentional close.
    async fn pump<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) -> bool
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();
        let shutdown = self.inner.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return true;
                }
                Some(msg) = outbound_rx.recv() => {
                    if let Err(e) = write.send(msg).await {
                        warn!(error = %e, "Remote messaging send failed");
                        return false;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Remote messaging read failed");
                        return false;
                    }
                },
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let Some(frame) = ServerMessage::parse(text) else {
            return;
        };
        match frame {
            ServerMessage::SetClientId { set_client_id } => {
                debug!(client_id = %set_client_id, "Received remote messaging client id");
                self.inner
                    .session_storage
                    .set_item(CLIENT_ID_STORAGE_KEY, &set_client_id);
            }
            ServerMessage::Remote { remote_message } => {
                let handler = self.inner.handler.lock().clone();
                match handler {
                    Some(handler) => handler(remote_message.topic, remote_message.message),
                    None => debug!(topic = %remote_message.topic, "No handler for remote message"),
                }
            }
            ServerMessage::Response {
                message_id,
                success,
                error,
                message,
            } => {
                let Some(pending) = self.inner.pending.lock().remove(&message_id) else {
                    debug!(message_id = %message_id, "Response for unknown or expired command");
                    return;
                };
                let result = if success && !error {
                    Ok(())
                } else {
                    Err(PortalError::Remote(
                        message.unwrap_or_else(|| "command failed".to_string()),
                    ))
                };
                let _ = pending.tx.send(result);
            }
        }
    }

    fn resubscribe(&self) {
        let topics = self.subscriptions();
        if topics.is_empty() {
            return;
        }
        info!(count = topics.len(), "Re-subscribing remote topics");
        let client = self.clone();
        tokio::spawn(async move {
            for topic in topics {
                if let Err(e) = client.subscribe(&topic).await {
                    error!(topic = %topic, error = %e, "Re-subscribing remote topic failed");
                }
            }
        });
    }

    fn fail_pending(&self, err: impl Fn() -> PortalError) {
        let drained: Vec<PendingCommand> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.tx.send(Err(err()));
        }
    }

    async fn run_timeout_sweep(&self) {
        let mut interval = tokio::time::interval(self.inner.config.remote_sweep_interval());
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            let now = Instant::now();
            let expired: Vec<(String, PendingCommand)> = {
                let mut pending = self.inner.pending.lock();
                let ids: Vec<String> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                    .collect()
            };
            for (id, pending) in expired {
                warn!(message_id = %id, "Remote command timed out");
                let _ = pending.tx.send(Err(PortalError::RemoteTimeout(id)));
            }
        }
    }
}
