// src/app/watch.rs
// Dev mode: reload apps when the server reports plugin updates

use super::WeakPortalAppService;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Path below the API base delivering server-sent plugin update events
pub const PUSH_PLUGIN_UPDATES_PATH: &str = "/portal-push-plugin-updates";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppUpdate {
    #[serde(rename = "pluginName")]
    pub plugin_name: String,
}

/// `{type, event}` message of the update stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "event", rename_all = "lowercase")]
pub enum PluginUpdateEvent {
    App(AppUpdate),
    Theme(Value),
    Layout(Value),
}

impl PluginUpdateEvent {
    pub fn parse(data: &str) -> Option<Self> {
        match serde_json::from_str(data) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "Ignoring unknown plugin update event");
                None
            }
        }
    }
}

/// Spawn the watch task. Cancel the returned token to stop it.
pub(crate) fn start(
    service: WeakPortalAppService,
    http: reqwest::Client,
    url: String,
    poll_interval: Duration,
) -> CancellationToken {
    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => debug!("Dev mode watch stopped"),
            _ = run(service, http, url, poll_interval) => {}
        }
    });
    token
}

async fn run(service: WeakPortalAppService, http: reqwest::Client, url: String, poll_interval: Duration) {
    if watch_event_stream(&service, &http, &url).await {
        return;
    }
    info!(interval_ms = poll_interval.as_millis() as u64, "Falling back to polling for app updates");
    poll(&service, poll_interval).await;
}

/// Returns true when the service went away, false when the stream failed
async fn watch_event_stream(service: &WeakPortalAppService, http: &reqwest::Client, url: &str) -> bool {
    let mut es = match EventSource::new(http.get(url)) {
        Ok(es) => es,
        Err(e) => {
            warn!(url, error = %e, "Cannot open plugin update stream");
            return false;
        }
    };

    while let Some(event) = es.next().await {
        match event {
            Ok(Event::Open) => debug!(url, "Plugin update stream opened"),
            Ok(Event::Message(msg)) => {
                let Some(update) = PluginUpdateEvent::parse(&msg.data) else {
                    continue;
                };
                let Some(service) = service.upgrade() else {
                    es.close();
                    return true;
                };
                service.handle_plugin_update(update).await;
            }
            Err(e) => {
                warn!(url, error = %e, "Plugin update stream failed");
                es.close();
                return false;
            }
        }
    }
    false
}

async fn poll(service: &WeakPortalAppService, poll_interval: Duration) {
    let mut interval = tokio::time::interval(poll_interval);
    // The first tick fires immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(service) = service.upgrade() else {
            return;
        };
        let updated = match service.check_loaded_apps_updated().await {
            Ok(updated) => updated,
            Err(e) => {
                debug!(error = %e, "Checking for app updates failed");
                continue;
            }
        };
        for plugin_name in updated {
            service
                .handle_plugin_update(PluginUpdateEvent::App(AppUpdate { plugin_name }))
                .await;
        }
    }
}
