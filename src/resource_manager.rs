// src/resource_manager.rs
// Reference-counted, de-duplicated JS/CSS resources shared by app instances

use crate::app::AppId;
use crate::host::{Dom, ElementId, ResourceKind, ResourceLoader};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

enum LoadState {
    /// Network load in flight; waiters resolve on load *and* on error
    Loading(Vec<oneshot::Sender<()>>),
    Loaded,
}

struct ResourceEntry {
    kind: ResourceKind,
    element: ElementId,
    state: LoadState,
    refs: HashSet<AppId>,
    /// Distinguishes a re-created entry from the one a finishing load belongs to
    token: u64,
}

struct Inner {
    dom: Arc<dyn Dom>,
    loader: Arc<dyn ResourceLoader>,
    entries: Mutex<HashMap<String, ResourceEntry>>,
    next_token: Mutex<u64>,
}

/// Tracks every resource element in the document head, keyed by URL.
///
/// A URL is attached at most once no matter how many apps request it; the
/// element is detached as soon as the last referencing app releases it.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new(dom: Arc<dyn Dom>, loader: Arc<dyn ResourceLoader>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dom,
                loader,
                entries: Mutex::new(HashMap::new()),
                next_token: Mutex::new(0),
            }),
        }
    }

    fn token(&self) -> u64 {
        let mut next = self.inner.next_token.lock();
        *next += 1;
        *next
    }

    /// Load a script for `owner`.
    ///
    /// Never fails: a broken script is logged and the call resolves so that
    /// dependent app startup is not blocked. The failed entry is dropped, so
    /// the next request for the URL tries again.
    pub async fn load_js(&self, url: &str, owner: &AppId) {
        let (waiter, token) = {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(url) {
                entry.refs.insert(owner.clone());
                match &mut entry.state {
                    LoadState::Loaded => return,
                    LoadState::Loading(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        (Some(rx), entry.token)
                    }
                }
            } else {
                // Tracked before the load starts so concurrent requests queue up
                let token = self.token();
                let element = self.attach(ResourceKind::Script, url);
                entries.insert(
                    url.to_string(),
                    ResourceEntry {
                        kind: ResourceKind::Script,
                        element,
                        state: LoadState::Loading(Vec::new()),
                        refs: HashSet::from([owner.clone()]),
                        token,
                    },
                );
                (None, token)
            }
        };

        if let Some(rx) = waiter {
            let _ = rx.await;
            return;
        }

        let result = self.inner.loader.load(ResourceKind::Script, url).await;

        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(url).filter(|e| e.token == token) else {
            debug!(url, "Script finished loading after it was released");
            return;
        };

        let waiters = match std::mem::replace(&mut entry.state, LoadState::Loaded) {
            LoadState::Loading(waiters) => waiters,
            LoadState::Loaded => Vec::new(),
        };

        if let Err(e) = result {
            error!(url, error = %e, "Loading script failed");
            if let Some(entry) = entries.remove(url) {
                self.inner.dom.remove(entry.element);
            }
        } else {
            debug!(url, "Script loaded");
        }

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Attach a stylesheet for `owner`. Does not wait for the load.
    pub fn load_style(&self, url: &str, owner: &AppId) {
        let token = {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(url) {
                entry.refs.insert(owner.clone());
                return;
            }
            let token = self.token();
            let element = self.attach(ResourceKind::Style, url);
            entries.insert(
                url.to_string(),
                ResourceEntry {
                    kind: ResourceKind::Style,
                    element,
                    state: LoadState::Loading(Vec::new()),
                    refs: HashSet::from([owner.clone()]),
                    token,
                },
            );
            token
        };

        if tokio::runtime::Handle::try_current().is_err() {
            warn!(url, "No async runtime; stylesheet load not observed");
            return;
        }

        let manager = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = manager.inner.loader.load(ResourceKind::Style, &url).await;
            if let Err(e) = &result {
                error!(url = %url, error = %e, "Loading stylesheet failed");
            }
            let mut entries = manager.inner.entries.lock();
            if let Some(entry) = entries.get_mut(&url).filter(|e| e.token == token) {
                entry.state = LoadState::Loaded;
            }
        });
    }

    /// Release everything `owner` references. Idempotent.
    pub fn unload_app_resources(&self, owner: &AppId) {
        let mut entries = self.inner.entries.lock();
        let mut released = Vec::new();
        for (url, entry) in entries.iter_mut() {
            if entry.refs.remove(owner) && entry.refs.is_empty() {
                released.push(url.clone());
            }
        }
        for url in released {
            if let Some(entry) = entries.remove(&url) {
                debug!(url = %url, kind = entry.kind.as_str(), "Removing unreferenced resource");
                self.inner.dom.remove(entry.element);
            }
        }
    }

    pub fn is_tracked(&self, url: &str) -> bool {
        self.inner.entries.lock().contains_key(url)
    }

    pub fn is_loaded(&self, url: &str) -> bool {
        self.inner
            .entries
            .lock()
            .get(url)
            .map(|e| matches!(e.state, LoadState::Loaded))
            .unwrap_or(false)
    }

    /// Number of apps referencing `url`
    pub fn ref_count(&self, url: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(url)
            .map(|e| e.refs.len())
            .unwrap_or(0)
    }

    fn attach(&self, kind: ResourceKind, url: &str) -> ElementId {
        let dom = &self.inner.dom;
        let element = dom.create_resource_element(kind, url);
        dom.insert_child(dom.head(), element, None);
        element
    }
}
