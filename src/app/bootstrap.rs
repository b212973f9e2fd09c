// src/app/bootstrap.rs
// Registry of app launch functions and the bootstrap call contract

use super::types::{AppSetup, LifecycleHooks};
use crate::host::{Dom, ElementId};
use crate::services::ClientServices;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::debug;

/// The element an app renders into
#[derive(Clone)]
pub struct AppHost {
    pub element: ElementId,
    pub dom: Arc<dyn Dom>,
}

/// What a launch function hands back: hooks right away, or later
pub enum BootstrapOutcome {
    Ready(Option<LifecycleHooks>),
    Pending(BoxFuture<'static, anyhow::Result<Option<LifecycleHooks>>>),
}

impl BootstrapOutcome {
    pub fn none() -> Self {
        BootstrapOutcome::Ready(None)
    }

    pub fn hooks(hooks: LifecycleHooks) -> Self {
        BootstrapOutcome::Ready(Some(hooks))
    }

    pub fn pending<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<Option<LifecycleHooks>>> + Send + 'static,
    {
        BootstrapOutcome::Pending(Box::pin(fut))
    }
}

pub type BootstrapFn =
    Arc<dyn Fn(AppHost, AppSetup, ClientServices) -> anyhow::Result<BootstrapOutcome> + Send + Sync>;

/// Launch functions by name, as referenced by `AppSetup::global_launch_function`.
///
/// App bundles register their function when they are loaded.
#[derive(Clone, Default)]
pub struct BootstrapRegistry {
    functions: Arc<RwLock<HashMap<String, BootstrapFn>>>,
}

impl BootstrapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, f: F)
    where
        F: Fn(AppHost, AppSetup, ClientServices) -> anyhow::Result<BootstrapOutcome>
            + Send
            + Sync
            + 'static,
    {
        debug!(name, "Registering launch function");
        self.functions.write().insert(name.to_string(), Arc::new(f));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.functions.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<BootstrapFn> {
        self.functions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Call a launch function and wait for its hooks. Panics count as failures.
pub(crate) async fn invoke(
    f: BootstrapFn,
    host: AppHost,
    setup: AppSetup,
    services: ClientServices,
) -> anyhow::Result<Option<LifecycleHooks>> {
    let outcome = catch_unwind(AssertUnwindSafe(|| f(host, setup, services)))
        .map_err(|p| anyhow::anyhow!("launch function panicked: {}", panic_message(p)))??;

    match outcome {
        BootstrapOutcome::Ready(hooks) => Ok(hooks),
        BootstrapOutcome::Pending(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .map_err(|p| anyhow::anyhow!("launch function panicked: {}", panic_message(p)))?,
    }
}
