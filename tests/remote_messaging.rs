// tests/remote_messaging.rs
// Remote messaging client and bus against an in-process WebSocket server

mod common;

use common::{eventually, fast_config};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use portal_runtime::PortalError;
use portal_runtime::config::ClientConfig;
use portal_runtime::host::{MemoryStorage, Storage};
use portal_runtime::messaging::remote::CLIENT_ID_STORAGE_KEY;
use portal_runtime::messaging::topic::topic_matches;
use portal_runtime::messaging::{ConnectionState, MessageBus, RemoteMessagingClient, callback};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

// ============================================================================
// Fake messaging server
// ============================================================================

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    topics: Vec<String>,
}

#[derive(Default)]
struct Broker {
    /// Request URIs of every accepted connection, in order
    connects: Mutex<Vec<String>>,
    commands: Mutex<Vec<Value>>,
    connections: Mutex<Vec<Connection>>,
    next_id: AtomicU64,
    /// Swallow commands instead of answering them
    silent: AtomicBool,
}

impl Broker {
    fn commands_for(&self, command: &str, topic: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c["command"] == command && c["topic"] == topic)
            .count()
    }

    /// Drop every open connection from the server side
    fn kick(&self) {
        for conn in self.connections.lock().drain(..) {
            let _ = conn.tx.send(Message::Close(None));
        }
    }

    fn reply(&self, conn_id: u64, frame: Value) {
        if let Some(conn) = self.connections.lock().iter().find(|c| c.id == conn_id) {
            let _ = conn.tx.send(Message::Text(frame.to_string().into()));
        }
    }

    fn handle_command(&self, conn_id: u64, command: Value) {
        self.commands.lock().push(command.clone());
        if self.silent.load(Ordering::SeqCst) {
            return;
        }
        let message_id = command["messageId"].clone();
        let topic = command["topic"].as_str().unwrap_or_default().to_string();

        if topic.starts_with("forbidden/") {
            self.reply(conn_id, json!({"messageId": message_id, "error": true, "message": "not allowed"}));
            return;
        }

        match command["command"].as_str() {
            Some("subscribe") => {
                if let Some(conn) = self.connections.lock().iter_mut().find(|c| c.id == conn_id) {
                    conn.topics.push(topic);
                }
            }
            Some("unsubscribe") => {
                if let Some(conn) = self.connections.lock().iter_mut().find(|c| c.id == conn_id) {
                    conn.topics.retain(|t| *t != topic);
                }
            }
            Some("publish") => {
                let frame = json!({"remoteMessage": {"topic": topic, "message": command["message"]}});
                for conn in self.connections.lock().iter() {
                    if conn.topics.iter().any(|pattern| topic_matches(pattern, &topic)) {
                        let _ = conn.tx.send(Message::Text(frame.to_string().into()));
                    }
                }
            }
            _ => {}
        }
        self.reply(conn_id, json!({"messageId": message_id, "success": true}));
    }
}

async fn serve_connection(broker: Arc<Broker>, stream: TcpStream) {
    let uri = Arc::new(Mutex::new(String::new()));
    let seen = uri.clone();
    let ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *seen.lock() = req.uri().to_string();
        Ok(resp)
    })
    .await
    .unwrap();
    let uri = uri.lock().clone();

    let id = broker.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let client_id = uri
        .split("clientId=")
        .nth(1)
        .map(str::to_string)
        .unwrap_or_else(|| format!("client-{}", id));
    broker.connects.lock().push(uri);

    let (tx, mut rx) = mpsc::unbounded_channel();
    broker.connections.lock().push(Connection {
        id,
        tx: tx.clone(),
        topics: Vec::new(),
    });
    let _ = tx.send(Message::Text(json!({"setClientId": client_id}).to_string().into()));

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                let closing = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(command) = serde_json::from_str::<Value>(text.as_str()) {
                        broker.handle_command(id, command);
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }
    broker.connections.lock().retain(|c| c.id != id);
}

async fn start_broker() -> (Arc<Broker>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/messaging", listener.local_addr().unwrap());
    let broker = Arc::new(Broker::default());
    let accepting = broker.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(accepting.clone(), stream));
        }
    });
    (broker, url)
}

fn remote_client(url: &str, config: ClientConfig) -> (RemoteMessagingClient, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let client = RemoteMessagingClient::new(url, storage.clone(), config);
    (client, storage)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn subscribe_waits_for_connection_and_resolves_on_ack() {
    let (broker, url) = start_broker().await;
    let (client, _storage) = remote_client(&url, fast_config());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    client.subscribe("global/news").await.unwrap();

    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.subscriptions(), vec!["global/news".to_string()]);
    assert_eq!(broker.commands_for("subscribe", "global/news"), 1);
    client.close();
}

#[tokio::test]
async fn server_error_rejects_the_command() {
    let (_broker, url) = start_broker().await;
    let (client, _storage) = remote_client(&url, fast_config());

    let result = client.subscribe("forbidden/admin").await;
    assert!(matches!(result, Err(PortalError::Remote(ref m)) if m == "not allowed"));
    assert!(client.subscriptions().is_empty());
    client.close();
}

#[tokio::test]
async fn unanswered_command_times_out() {
    let (broker, url) = start_broker().await;
    broker.silent.store(true, Ordering::SeqCst);
    let config = ClientConfig {
        remote_command_timeout_ms: 100,
        remote_sweep_interval_ms: 20,
        ..fast_config()
    };
    let (client, _storage) = remote_client(&url, config);

    let result = client.publish("global/news", json!("hello")).await;
    assert!(matches!(result, Err(PortalError::RemoteTimeout(_))));
    assert_eq!(broker.commands_for("publish", "global/news"), 1);
    client.close();
}

#[tokio::test]
async fn wildcard_subscription_receives_remote_publish_through_bus() {
    let (_broker, url) = start_broker().await;
    let (receiver, _) = remote_client(&url, fast_config());
    let (sender, _) = remote_client(&url, fast_config());
    let receiving_bus = MessageBus::new(Some(receiver.clone()), None);
    let sending_bus = MessageBus::new(Some(sender.clone()), None);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    receiving_bus
        .subscribe(
            "remote:global/+",
            callback(move |data, topic, sender| {
                assert!(sender.is_none());
                sink.lock().push((topic.to_string(), data));
            }),
        )
        .await
        .unwrap();

    sending_bus
        .publish("remote:global/news", json!({"headline": "hi"}))
        .await
        .unwrap();
    sending_bus
        .publish("remote:other/news", json!({"headline": "ignored"}))
        .await
        .unwrap();

    eventually("remote delivery", || !received.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *received.lock(),
        vec![("remote:global/news".to_string(), json!({"headline": "hi"}))]
    );

    receiver.close();
    sender.close();
}

#[tokio::test]
async fn server_subscription_follows_first_and_last_bus_subscriber() {
    let (broker, url) = start_broker().await;
    let (client, _) = remote_client(&url, fast_config());
    let bus = MessageBus::new(Some(client.clone()), None);

    let first = callback(|_, _, _| {});
    let second = callback(|_, _, _| {});
    bus.subscribe("remote:team/chat", first.clone()).await.unwrap();
    bus.subscribe("remote:team/chat", second.clone()).await.unwrap();
    assert_eq!(broker.commands_for("subscribe", "team/chat"), 1);

    bus.unsubscribe("remote:team/chat", &first).await.unwrap();
    assert_eq!(broker.commands_for("unsubscribe", "team/chat"), 0);

    bus.unsubscribe("remote:team/chat", &second).await.unwrap();
    assert_eq!(broker.commands_for("unsubscribe", "team/chat"), 1);
    assert!(client.subscriptions().is_empty());
    client.close();
}

#[tokio::test]
async fn fired_remote_subscribe_once_unsubscribes_on_server() {
    let (broker, url) = start_broker().await;
    let (receiver, _) = remote_client(&url, fast_config());
    let (sender, _) = remote_client(&url, fast_config());
    let receiving_bus = MessageBus::new(Some(receiver.clone()), None);
    let sending_bus = MessageBus::new(Some(sender.clone()), None);

    let received = Arc::new(Mutex::new(0usize));
    let sink = received.clone();
    receiving_bus
        .subscribe_once("remote:t/x", callback(move |_, _, _| *sink.lock() += 1))
        .await
        .unwrap();
    assert_eq!(receiver.subscriptions(), vec!["t/x".to_string()]);

    sending_bus.publish("remote:t/x", json!(1)).await.unwrap();
    eventually("server unsubscribe", || broker.commands_for("unsubscribe", "t/x") == 1).await;

    assert_eq!(*received.lock(), 1);
    assert_eq!(receiving_bus.subscription_count("remote:t/x"), 0);
    assert!(receiver.subscriptions().is_empty());

    receiver.close();
    sender.close();
}

#[tokio::test]
async fn reconnect_replays_client_id_and_subscriptions() {
    let (broker, url) = start_broker().await;
    let (client, storage) = remote_client(&url, fast_config());

    client.subscribe("global/a").await.unwrap();
    eventually("client id", || storage.get_item(CLIENT_ID_STORAGE_KEY).is_some()).await;
    assert_eq!(storage.get_item(CLIENT_ID_STORAGE_KEY).as_deref(), Some("client-1"));
    assert!(!broker.connects.lock()[0].contains("clientId"));

    broker.kick();
    eventually("reconnect", || broker.connects.lock().len() == 2).await;
    assert!(broker.connects.lock()[1].contains("clientId=client-1"));

    eventually("resubscribe", || broker.commands_for("subscribe", "global/a") == 2).await;
    eventually("connected", || client.connection_state() == ConnectionState::Connected).await;
    client.close();
}

#[tokio::test]
async fn gives_up_after_reconnect_budget() {
    // Bound and dropped: nothing listens on this port afterwards
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/messaging", listener.local_addr().unwrap());
    drop(listener);

    let config = ClientConfig {
        reconnect_base_delay_ms: 5,
        reconnect_max_delay_ms: 10,
        reconnect_max_attempts: 2,
        ..fast_config()
    };
    let (client, _) = remote_client(&url, config);
    let mut states = client.state_changes();
    client.start();

    tokio::time::timeout(Duration::from_secs(2), async {
        while *states.borrow_and_update() != ConnectionState::Terminated {
            states.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let result = client.subscribe("global/news").await;
    assert!(matches!(result, Err(PortalError::Disconnected)));
}
