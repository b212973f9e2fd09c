// src/messaging/bus.rs
// In-process publish/subscribe with remote topic bridging and interceptors

use super::remote::RemoteMessagingClient;
use super::topic::{self, REMOTE_PREFIX};
use crate::app::AppId;
use crate::error::{PortalError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Subscriber callback: `(data, topic, sender app id)`.
///
/// Identity is the `Arc` allocation: keep the `Arc` to unsubscribe later.
pub type MessageCallback = Arc<dyn Fn(Value, &str, Option<&AppId>) + Send + Sync>;

/// Interceptor callback. Returning `Some` replaces the payload for this delivery.
pub type MessageInterceptor = Arc<dyn Fn(&InterceptedMessage<'_>) -> Option<Value> + Send + Sync>;

/// Wrap a closure as a [`MessageCallback`]
pub fn callback<F>(f: F) -> MessageCallback
where
    F: Fn(Value, &str, Option<&AppId>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`MessageInterceptor`]
pub fn interceptor<F>(f: F) -> MessageInterceptor
where
    F: Fn(&InterceptedMessage<'_>) -> Option<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One delivery as seen by an interceptor
pub struct InterceptedMessage<'a> {
    pub data: &'a Value,
    pub topic: &'a str,
    pub sender_app_id: Option<&'a AppId>,
    pub receiver_app_id: Option<&'a AppId>,
    cancelled: Cell<bool>,
}

impl InterceptedMessage<'_> {
    /// Drop this delivery. Remaining interceptors are skipped.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }
}

/// Returned by interceptor registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorToken(u64);

#[derive(Clone)]
struct Subscription {
    topic: String,
    callback: MessageCallback,
    once: bool,
    app_id: Option<AppId>,
}

struct InterceptorEntry {
    token: InterceptorToken,
    interceptor: MessageInterceptor,
    app_id: Option<AppId>,
}

struct Delivery {
    topic: String,
    data: Value,
    sender: Option<AppId>,
    targets: Vec<Subscription>,
}

struct BusInner {
    /// All subscriptions in registration order
    subscriptions: Mutex<Vec<Subscription>>,
    interceptors: Mutex<Vec<InterceptorEntry>>,
    next_token: Mutex<u64>,
    remote: Option<RemoteMessagingClient>,
    private_user_topic: Option<String>,
    queue: mpsc::UnboundedSender<Delivery>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

fn same_callback(a: &MessageCallback, b: &MessageCallback) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// The message bus.
///
/// Cloning shares the subscription table. [`MessageBus::get_app_instance`]
/// returns a view whose subscriptions, interceptors and publishes are
/// attributed to one app.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
    app_id: Option<AppId>,
}

impl MessageBus {
    pub fn new(remote: Option<RemoteMessagingClient>, private_user_topic: Option<String>) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BusInner {
            subscriptions: Mutex::new(Vec::new()),
            interceptors: Mutex::new(Vec::new()),
            next_token: Mutex::new(0),
            remote,
            private_user_topic,
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
        });

        if let Some(remote) = &inner.remote {
            let weak = Arc::downgrade(&inner);
            remote.set_message_handler(Arc::new(move |topic, message| {
                if let Some(inner) = weak.upgrade() {
                    MessageBus { inner, app_id: None }.deliver_remote(&topic, message);
                }
            }));
        }

        Self { inner, app_id: None }
    }

    /// View bound to `app_id`, sharing the underlying subscriptions
    pub fn get_app_instance(&self, app_id: &AppId) -> Self {
        Self {
            inner: self.inner.clone(),
            app_id: Some(app_id.clone()),
        }
    }

    pub fn app_id(&self) -> Option<&AppId> {
        self.app_id.as_ref()
    }

    pub fn remote_prefix(&self) -> &'static str {
        REMOTE_PREFIX
    }

    pub fn has_remote_messaging(&self) -> bool {
        self.inner.remote.is_some()
    }

    /// Private topic of the current user, or of `other_user` (same layout,
    /// last segment replaced). Without the remote prefix.
    pub fn remote_user_private_topic(&self, other_user: Option<&str>) -> Option<String> {
        let own = self.inner.private_user_topic.as_ref()?;
        match other_user {
            None => Some(own.clone()),
            Some(user) => match own.rsplit_once('/') {
                Some((base, _)) => Some(format!("{}/{}", base, user)),
                None => Some(user.to_string()),
            },
        }
    }

    pub async fn subscribe(&self, topic: &str, callback: MessageCallback) -> Result<()> {
        self.add_subscription(topic, callback, false).await
    }

    /// Subscribe for a single delivery
    pub async fn subscribe_once(&self, topic: &str, callback: MessageCallback) -> Result<()> {
        self.add_subscription(topic, callback, true).await
    }

    async fn add_subscription(&self, topic: &str, callback: MessageCallback, once: bool) -> Result<()> {
        topic::validate(topic)?;
        if !topic::is_remote(topic) && topic::contains_wildcard(topic) {
            return Err(PortalError::InvalidTopic(format!(
                "{} (wildcards are only supported for remote topics)",
                topic
            )));
        }

        let first_for_topic = {
            let subscriptions = self.inner.subscriptions.lock();
            if subscriptions
                .iter()
                .any(|s| s.topic == topic && same_callback(&s.callback, &callback))
            {
                debug!(topic, "Callback already subscribed");
                return Ok(());
            }
            !subscriptions.iter().any(|s| s.topic == topic)
        };

        if let Some(remote_topic) = topic::strip_remote(topic) {
            let remote = self
                .inner
                .remote
                .as_ref()
                .ok_or(PortalError::RemoteMessagingUnavailable)?;
            topic::pattern_to_regex(remote_topic)?;
            if first_for_topic {
                remote.subscribe(remote_topic).await?;
            }
        }

        let mut subscriptions = self.inner.subscriptions.lock();
        // Re-check: an identical subscription may have landed while awaiting the server
        if subscriptions
            .iter()
            .any(|s| s.topic == topic && same_callback(&s.callback, &callback))
        {
            return Ok(());
        }
        subscriptions.push(Subscription {
            topic: topic.to_string(),
            callback,
            once,
            app_id: self.app_id.clone(),
        });
        debug!(topic, app_id = ?self.app_id, once, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str, callback: &MessageCallback) -> Result<()> {
        let now_empty = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let before = subscriptions.len();
            subscriptions.retain(|s| !(s.topic == topic && same_callback(&s.callback, callback)));
            if subscriptions.len() == before {
                debug!(topic, "Unsubscribe of unknown callback");
                return Ok(());
            }
            !subscriptions.iter().any(|s| s.topic == topic)
        };

        if now_empty {
            if let (Some(remote_topic), Some(remote)) = (topic::strip_remote(topic), &self.inner.remote) {
                remote.unsubscribe(remote_topic).await?;
            }
        }
        Ok(())
    }

    /// Publish `data` on `topic`. Local subscribers are invoked later, never
    /// from within this call.
    pub async fn publish(&self, topic: &str, data: Value) -> Result<()> {
        topic::validate(topic)?;
        if topic::contains_wildcard(topic) {
            return Err(PortalError::InvalidTopic(format!("{} (cannot publish to a wildcard)", topic)));
        }

        if let Some(remote_topic) = topic::strip_remote(topic) {
            let remote = self
                .inner
                .remote
                .as_ref()
                .ok_or(PortalError::RemoteMessagingUnavailable)?;
            return remote.publish(remote_topic, data).await;
        }

        let targets = self.take_targets(|s| s.topic == topic);
        debug!(topic, sender = ?self.app_id, receivers = targets.len(), "Publishing");
        self.enqueue(Delivery {
            topic: topic.to_string(),
            data,
            sender: self.app_id.clone(),
            targets,
        });
        Ok(())
    }

    /// Number of callbacks subscribed to exactly `topic`
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.topic == topic)
            .count()
    }

    pub fn register_message_interceptor(&self, interceptor: MessageInterceptor) -> InterceptorToken {
        let token = {
            let mut next = self.inner.next_token.lock();
            *next += 1;
            InterceptorToken(*next)
        };
        self.inner.interceptors.lock().push(InterceptorEntry {
            token,
            interceptor,
            app_id: self.app_id.clone(),
        });
        token
    }

    pub fn unregister_message_interceptor(&self, token: InterceptorToken) -> bool {
        let mut interceptors = self.inner.interceptors.lock();
        let before = interceptors.len();
        interceptors.retain(|i| i.token != token);
        interceptors.len() != before
    }

    /// Drop every subscription and interceptor owned by `app_id`
    pub fn unsubscribe_everything_from_app(&self, app_id: &AppId) {
        let orphaned_remote: Vec<String> = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let removed: Vec<String> = subscriptions
                .iter()
                .filter(|s| s.app_id.as_ref() == Some(app_id))
                .map(|s| s.topic.clone())
                .collect();
            subscriptions.retain(|s| s.app_id.as_ref() != Some(app_id));

            orphaned_remote_topics(removed, &subscriptions)
        };
        self.inner
            .interceptors
            .lock()
            .retain(|i| i.app_id.as_ref() != Some(app_id));

        debug!(app_id = %app_id, "Removed all subscriptions of app");
        self.spawn_remote_unsubscribes(orphaned_remote);
    }

    /// Tell the server about remote topics that no longer have local subscribers
    fn spawn_remote_unsubscribes(&self, topics: Vec<String>) {
        let Some(remote) = self.inner.remote.clone() else {
            return;
        };
        if topics.is_empty() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        tokio::spawn(async move {
            for topic in topics {
                if let Some(remote_topic) = topic::strip_remote(&topic) {
                    if let Err(e) = remote.unsubscribe(remote_topic).await {
                        warn!(topic = %topic, error = %e, "Remote unsubscribe failed");
                    }
                }
            }
        });
    }

    /// Relay a message that arrived from the server
    fn deliver_remote(&self, remote_topic: &str, data: Value) {
        let targets = self.take_targets(|s| {
            topic::strip_remote(&s.topic)
                .map(|pattern| topic::topic_matches(pattern, remote_topic))
                .unwrap_or(false)
        });
        if targets.is_empty() {
            debug!(topic = remote_topic, "Remote message without subscribers");
            return;
        }
        self.enqueue(Delivery {
            topic: format!("{}{}", REMOTE_PREFIX, remote_topic),
            data,
            sender: None,
            targets,
        });
    }

    /// Snapshot matching subscriptions; one-shot ones are removed right away
    fn take_targets(&self, matches: impl Fn(&Subscription) -> bool) -> Vec<Subscription> {
        let (targets, orphaned) = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let targets: Vec<Subscription> = subscriptions.iter().filter(|s| matches(s)).cloned().collect();
            subscriptions.retain(|s| !(s.once && matches(s)));
            let fired_once = targets.iter().filter(|s| s.once).map(|s| s.topic.clone()).collect();
            (targets, orphaned_remote_topics(fired_once, &subscriptions))
        };
        self.spawn_remote_unsubscribes(orphaned);
        targets
    }

    fn enqueue(&self, delivery: Delivery) {
        if delivery.targets.is_empty() {
            return;
        }
        self.ensure_dispatcher();
        if self.inner.queue.send(delivery).is_err() {
            warn!("Message bus dispatcher stopped, dropping delivery");
        }
    }

    fn ensure_dispatcher(&self) {
        let Some(mut rx) = self.inner.queue_rx.lock().take() else {
            return;
        };
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                dispatch(&inner, delivery);
                drop(inner);
                // Let other tasks run between deliveries
                tokio::task::yield_now().await;
            }
        });
    }
}

/// Remote topics among `removed` with no subscription left, each listed once
fn orphaned_remote_topics(removed: Vec<String>, remaining: &[Subscription]) -> Vec<String> {
    let mut orphaned: Vec<String> = Vec::new();
    for topic in removed {
        if topic::is_remote(&topic)
            && !remaining.iter().any(|s| s.topic == topic)
            && !orphaned.contains(&topic)
        {
            orphaned.push(topic);
        }
    }
    orphaned
}

fn dispatch(inner: &BusInner, delivery: Delivery) {
    let interceptors: Vec<MessageInterceptor> = inner
        .interceptors
        .lock()
        .iter()
        .map(|i| i.interceptor.clone())
        .collect();

    for target in &delivery.targets {
        let mut data = delivery.data.clone();
        let mut cancelled = false;

        for interceptor in &interceptors {
            let message = InterceptedMessage {
                data: &data,
                topic: &delivery.topic,
                sender_app_id: delivery.sender.as_ref(),
                receiver_app_id: target.app_id.as_ref(),
                cancelled: Cell::new(false),
            };
            let result = catch_unwind(AssertUnwindSafe(|| interceptor(&message)));
            let was_cancelled = message.cancelled.get();
            match result {
                Ok(Some(replacement)) if !was_cancelled => data = replacement,
                Ok(_) => {}
                Err(_) => error!(topic = %delivery.topic, "Message interceptor panicked"),
            }
            if was_cancelled {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            debug!(topic = %delivery.topic, receiver = ?target.app_id, "Delivery cancelled by interceptor");
            continue;
        }

        let callback = target.callback.clone();
        let topic = delivery.topic.as_str();
        let sender = delivery.sender.as_ref();
        if catch_unwind(AssertUnwindSafe(|| callback(data, topic, sender))).is_err() {
            error!(topic, receiver = ?target.app_id, "Message subscriber panicked");
        }
    }
}
