// src/app/listeners.rs
// Observer lists with typed unregister tokens

use super::types::LoadedApp;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;

pub type AppLoadedListener = Arc<dyn Fn(&LoadedApp) + Send + Sync>;
pub type AppAboutToUnloadListener = Arc<dyn Fn(&LoadedApp) + Send + Sync>;
/// Called when the server signals a theme or layout change in dev mode
pub type PageReloadListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned on registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

pub struct ObserverList<F: ?Sized> {
    name: &'static str,
    entries: Mutex<Vec<(ListenerToken, Arc<F>)>>,
    next: Mutex<u64>,
}

impl<F: ?Sized> ObserverList<F> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(Vec::new()),
            next: Mutex::new(0),
        }
    }

    pub fn register(&self, listener: Arc<F>) -> ListenerToken {
        let token = {
            let mut next = self.next.lock();
            *next += 1;
            ListenerToken(*next)
        };
        self.entries.lock().push((token, listener));
        token
    }

    /// Returns false if the token was not registered
    pub fn unregister(&self, token: ListenerToken) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(t, _)| *t != token);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener in registration order. A panicking listener is
    /// logged and the remaining ones still run.
    pub fn notify(&self, call: impl Fn(&F)) {
        // Snapshot so listeners may (un)register while being notified
        let listeners: Vec<Arc<F>> = self.entries.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| call(&listener))).is_err() {
                error!(listeners = self.name, "Listener panicked");
            }
        }
    }
}
