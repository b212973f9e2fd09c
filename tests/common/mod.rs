// tests/common/mod.rs
// Shared fixtures: in-process portal API server, recording loader, host setup

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use portal_runtime::config::{ClientConfig, PortalGlobals};
use portal_runtime::host::{
    Dom, HostEnvironment, Location, MemoryStorage, ResourceKind, ResourceLoadError, ResourceLoader, VirtualDom,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Start(ResourceKind, String),
    End(ResourceKind, String),
}

/// Loader that records start/end of every load and can fail chosen URLs
pub struct RecordingLoader {
    pub events: Mutex<Vec<LoadEvent>>,
    pub delay: Duration,
    pub failing: Mutex<Vec<String>>,
}

impl RecordingLoader {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            delay,
            failing: Mutex::new(Vec::new()),
        })
    }

    pub fn script_events(&self) -> Vec<LoadEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, LoadEvent::Start(ResourceKind::Script, _) | LoadEvent::End(ResourceKind::Script, _)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResourceLoader for RecordingLoader {
    async fn load(&self, kind: ResourceKind, url: &str) -> Result<(), ResourceLoadError> {
        self.events.lock().push(LoadEvent::Start(kind, url.to_string()));
        tokio::time::sleep(self.delay).await;
        self.events.lock().push(LoadEvent::End(kind, url.to_string()));
        if self.failing.lock().iter().any(|f| f == url) {
            return Err(ResourceLoadError {
                url: url.to_string(),
                reason: "HTTP 404".to_string(),
            });
        }
        Ok(())
    }
}

/// State of the fake portal server
#[derive(Default)]
pub struct ServerState {
    pub base_url: String,
    /// plugin name -> (version, shared js, app js, app css, last reload ts)
    pub apps: Mutex<HashMap<String, TestApp>>,
    pub setup_requests: Mutex<Vec<String>>,
    pub log_entries: Mutex<Vec<Value>>,
    pub csrf_tokens: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct TestApp {
    pub version: String,
    pub shared_js: Vec<String>,
    pub js: Vec<String>,
    pub css: Vec<String>,
    pub last_reload_ts: i64,
    pub app_config: Value,
}

impl TestApp {
    pub fn new(js: &[&str]) -> Self {
        Self {
            version: "1.0.0".to_string(),
            js: js.iter().map(|s| s.to_string()).collect(),
            last_reload_ts: 1000,
            app_config: json!({}),
            ..Default::default()
        }
    }
}

pub fn launch_function(plugin_name: &str) -> String {
    format!("start{}", plugin_name.replace(' ', ""))
}

fn setup_json(state: &ServerState, plugin: &str, instance: Option<&str>) -> Value {
    let apps = state.apps.lock();
    let Some(app) = apps.get(plugin) else {
        return json!({"pluginName": plugin, "pluginMissing": true});
    };
    json!({
        "pluginName": plugin,
        "title": format!("{} Title", plugin),
        "version": app.version,
        "instanceId": instance,
        "lastReloadTs": app.last_reload_ts,
        "resourcesBasePath": format!("{}/apps/{}", state.base_url, plugin),
        "sharedResourcesBasePath": format!("{}/shared", state.base_url),
        "resources": {"js": app.js, "css": app.css},
        "sharedResources": {"js": app.shared_js, "css": []},
        "restProxyPaths": {},
        "globalLaunchFunction": launch_function(plugin),
        "lang": "en",
        "user": {"guest": true},
        "appConfig": app.app_config,
    })
}

async fn app_setup(
    State(state): State<Arc<ServerState>>,
    Path((_page, plugin)): Path<(String, String)>,
) -> Json<Value> {
    state.setup_requests.lock().push(plugin.clone());
    Json(setup_json(&state, &plugin, None))
}

async fn instance_setup(
    State(state): State<Arc<ServerState>>,
    Path((_page, plugin, instance)): Path<(String, String, String)>,
) -> Json<Value> {
    state.setup_requests.lock().push(plugin.clone());
    Json(setup_json(&state, &plugin, Some(&instance)))
}

async fn portal_apps(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let since: i64 = query
        .get("updatedSince")
        .and_then(|s| s.parse().ok())
        .unwrap_or(i64::MIN);
    let apps: Vec<Value> = state
        .apps
        .lock()
        .iter()
        .filter(|(_, a)| a.last_reload_ts > since)
        .map(|(name, a)| {
            json!({
                "name": name,
                "title": name,
                "version": a.version,
                "category": "test",
                "lastReloadTs": a.last_reload_ts,
            })
        })
        .collect();
    Json(Value::Array(apps))
}

async fn log(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(entries): Json<Vec<Value>>,
) -> StatusCode {
    if let Some(token) = headers.get("X-CSRF-Token").and_then(|v| v.to_str().ok()) {
        state.csrf_tokens.lock().push(token.to_string());
    }
    state.log_entries.lock().extend(entries);
    StatusCode::OK
}

async fn failing() -> (StatusCode, Json<Value>) {
    (StatusCode::FORBIDDEN, Json(json!({"message": "Access denied"})))
}

/// Start the fake portal API on a random port. Returns its state; the API
/// lives below `{base_url}/api`.
pub async fn start_portal_server() -> Arc<ServerState> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState {
        base_url: format!("http://{}", addr),
        ..Default::default()
    });

    let app = Router::new()
        .route("/api/pages/{page}/portal-app-instances/{plugin}", get(app_setup))
        .route("/api/pages/{page}/portal-app-instances/{plugin}/{instance}", get(instance_setup))
        .route("/api/portal-apps", get(portal_apps))
        .route("/api/log", post(log))
        .route("/api/forbidden", get(failing))
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    state
}

pub fn api_path(state: &ServerState) -> String {
    format!("{}/api", state.base_url)
}

pub struct TestHost {
    pub dom: Arc<VirtualDom>,
    pub loader: Arc<RecordingLoader>,
    pub env: HostEnvironment,
}

/// Page with the areas `area1`, `area2` and the modal overlay
pub fn test_host(loader_delay: Duration) -> TestHost {
    let dom = Arc::new(VirtualDom::new());
    dom.create_element("area1", None);
    dom.create_element("area2", None);
    let overlay = dom.create_element(portal_runtime::app::MODAL_OVERLAY_ID, None);
    dom.create_element(portal_runtime::app::MODAL_OVERLAY_TITLE_ID, Some(overlay));
    dom.create_element(portal_runtime::app::MODAL_OVERLAY_APP_ID, Some(overlay));
    dom.set_visible(overlay, false);

    let loader = RecordingLoader::new(loader_delay);
    let env = HostEnvironment {
        dom: dom.clone(),
        loader: loader.clone(),
        location: Arc::new(Location::parse("http://localhost/portal/web/test-page").unwrap()),
        session_storage: Arc::new(MemoryStorage::new()),
        local_storage: Arc::new(MemoryStorage::new()),
    };
    TestHost { dom, loader, env }
}

pub fn test_globals(state: &ServerState) -> PortalGlobals {
    PortalGlobals {
        api_path: api_path(state),
        page_id: "test-page".to_string(),
        csrf_token: Some("csrf-123".to_string()),
        ..Default::default()
    }
}

pub fn fast_config() -> ClientConfig {
    ClientConfig {
        remote_ready_timeout_ms: 2000,
        remote_ready_check_interval_ms: 10,
        remote_command_timeout_ms: 2000,
        remote_sweep_interval_ms: 50,
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        reconnect_max_attempts: 5,
        log_flush_interval_ms: 20,
        dev_poll_interval_ms: 50,
        app_setup_timeout_ms: 2000,
        ..Default::default()
    }
}

/// Give deferred deliveries and spawned tasks a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Poll `condition` for up to two seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
