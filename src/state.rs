// src/state.rs
// Ephemeral state in the URL query, session storage and local storage

use crate::host::{Location, Storage};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

struct StateStores {
    location: Arc<Location>,
    session: Arc<dyn Storage>,
    local: Arc<dyn Storage>,
}

/// State service, optionally scoped to an app.
///
/// Scoped instances prefix every key with `<pluginName>__`, so apps cannot
/// read or overwrite each other's entries. Values are stored as JSON.
#[derive(Clone)]
pub struct StateService {
    stores: Arc<StateStores>,
    prefix: Option<String>,
}

impl StateService {
    pub fn new(location: Arc<Location>, session: Arc<dyn Storage>, local: Arc<dyn Storage>) -> Self {
        Self {
            stores: Arc::new(StateStores {
                location,
                session,
                local,
            }),
            prefix: None,
        }
    }

    /// A view of the same stores with keys prefixed for `plugin_name`
    pub fn scoped(&self, plugin_name: &str) -> Self {
        Self {
            stores: self.stores.clone(),
            prefix: Some(format!("{}__", plugin_name)),
        }
    }

    fn key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Look the key up in the URL query, then session storage, then local storage
    pub fn get_state_property(&self, key: &str) -> Option<Value> {
        let key = self.key(key);
        if let Some(raw) = self.stores.location.query_param(&key) {
            return Some(parse_query_value(&raw));
        }
        self.stores
            .session
            .get_item(&key)
            .or_else(|| self.stores.local.get_item(&key))
            .and_then(|raw| parse_stored(&key, &raw))
    }

    pub fn set_url_state_property(&self, key: &str, value: Option<&Value>) {
        let key = self.key(key);
        let encoded = value.map(encode_query_value);
        self.stores.location.replace_query_param(&key, encoded.as_deref());
    }

    pub fn set_session_state_property(&self, key: &str, value: &Value) {
        self.stores.session.set_item(&self.key(key), &value.to_string());
    }

    pub fn set_local_store_state_property(&self, key: &str, value: &Value) {
        self.stores.local.set_item(&self.key(key), &value.to_string());
    }

    /// Remove the key from all three stores
    pub fn remove_state_property(&self, key: &str) {
        let key = self.key(key);
        self.stores.location.replace_query_param(&key, None);
        self.stores.session.remove_item(&key);
        self.stores.local.remove_item(&key);
    }
}

/// Plain strings go into the query unquoted, everything else as JSON
fn encode_query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_query_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_stored(key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "Ignoring unparsable state property");
            None
        }
    }
}
