// src/app/types.rs
// App setup payload, registry snapshot and lifecycle hook types

use crate::host::ElementId;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Client-generated identity of a loaded app instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppId(String);

impl AppId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AppId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// JS and CSS file lists of an app or of the shared resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppResources {
    #[serde(default)]
    pub js: Vec<String>,
    #[serde(default)]
    pub css: Vec<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Setup of an app instance as delivered by
/// `GET /pages/{pageId}/portal-app-instances/{pluginName}[/{instanceId}]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSetup {
    pub plugin_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub last_reload_ts: i64,
    #[serde(default)]
    pub resources_base_path: String,
    #[serde(default)]
    pub shared_resources_base_path: Option<String>,
    #[serde(default)]
    pub resources: AppResources,
    #[serde(default)]
    pub shared_resources: Option<AppResources>,
    #[serde(default)]
    pub rest_proxy_paths: HashMap<String, String>,
    #[serde(default)]
    pub global_launch_function: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub user: Value,
    #[serde(default = "empty_object")]
    pub app_config: Value,
    #[serde(default)]
    pub plugin_missing: bool,
}

impl AppSetup {
    /// Minimal setup, mainly for hosts that assemble setups themselves
    pub fn new(plugin_name: impl Into<String>, launch_function: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            title: None,
            version: String::new(),
            instance_id: None,
            last_reload_ts: 0,
            resources_base_path: String::new(),
            shared_resources_base_path: None,
            resources: AppResources::default(),
            shared_resources: None,
            rest_proxy_paths: HashMap::new(),
            global_launch_function: launch_function.into(),
            lang: String::new(),
            user: Value::Null,
            app_config: empty_object(),
            plugin_missing: false,
        }
    }
}

/// Shallow merge: top-level keys of `overrides` replace those of `base`.
/// A non-object `overrides` (other than null) replaces `base` entirely.
pub fn merge_app_config(base: &Value, overrides: Option<&Value>) -> Value {
    match (base, overrides) {
        (_, None) | (_, Some(Value::Null)) => base.clone(),
        (Value::Object(base), Some(Value::Object(overrides))) => {
            let mut merged = base.clone();
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Some(other)) => other.clone(),
    }
}

/// App entry of `GET /portal-apps`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableApp {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub last_reload_ts: i64,
}

/// Result of a lifecycle hook that may complete later
pub enum HookOutcome {
    Done,
    Pending(BoxFuture<'static, anyhow::Result<()>>),
}

pub type WillBeRemovedHook = Arc<dyn Fn() -> anyhow::Result<HookOutcome> + Send + Sync>;
pub type UpdateAppConfigHook = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

/// Hooks an app hands back from its bootstrap function
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub will_be_removed: Option<WillBeRemovedHook>,
    pub update_app_config: Option<UpdateAppConfigHook>,
}

impl LifecycleHooks {
    pub fn on_will_be_removed<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<HookOutcome> + Send + Sync + 'static,
    {
        self.will_be_removed = Some(Arc::new(hook));
        self
    }

    pub fn on_update_app_config<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.update_app_config = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("will_be_removed", &self.will_be_removed.is_some())
            .field("update_app_config", &self.update_app_config.is_some())
            .finish()
    }
}

/// Snapshot of a registry entry
#[derive(Debug, Clone)]
pub struct LoadedApp {
    pub id: AppId,
    pub plugin_name: String,
    pub instance_id: Option<String>,
    pub title: Option<String>,
    pub app_setup: Option<AppSetup>,
    pub loaded_ts: DateTime<Utc>,
    pub portal_app_area_id: String,
    pub portal_app_wrapper_element: ElementId,
    pub portal_app_host_element: ElementId,
    pub portal_app_title_element: Option<ElementId>,
    pub modal: bool,
    pub error: bool,
    pub error_plugin_missing: bool,
}

impl LoadedApp {
    pub fn version(&self) -> Option<&str> {
        self.app_setup.as_ref().map(|s| s.version.as_str())
    }

    pub fn app_config(&self) -> Option<&Value> {
        self.app_setup.as_ref().map(|s| &s.app_config)
    }
}

/// Registry entry owned by the app service
pub(crate) struct AppEntry {
    pub app: LoadedApp,
    pub hooks: Option<LifecycleHooks>,
    /// Config override of dynamically loaded instances, kept across reloads
    pub override_config: Option<Value>,
    /// Bumped on every load/reload so superseded results can be discarded
    pub generation: u64,
}
