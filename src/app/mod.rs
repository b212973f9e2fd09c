// src/app/mod.rs
// Portal app lifecycle: load, reload, move and unload app instances

pub mod bootstrap;
pub mod listeners;
pub mod modal;
pub mod templates;
pub mod types;
pub mod watch;

pub use bootstrap::{AppHost, BootstrapFn, BootstrapOutcome, BootstrapRegistry};
pub use listeners::{ListenerToken, ObserverList};
pub use modal::{MODAL_OVERLAY_APP_ID, MODAL_OVERLAY_ID, MODAL_OVERLAY_TITLE_ID, ModalCloseCallback};
pub use templates::Templates;
pub use types::{
    AppId, AppResources, AppSetup, AvailableApp, HookOutcome, LifecycleHooks, LoadedApp, merge_app_config,
};
pub use watch::PluginUpdateEvent;

use crate::config::{ClientConfig, PortalGlobals};
use crate::error::{PortalError, Result};
use crate::host::{Dom, HostEnvironment, Key};
use crate::messaging::MessageBus;
use crate::remote_logger::RemoteLogger;
use crate::resource_manager::ResourceManager;
use crate::rest::{RestClient, RestError};
use crate::services::{ClientServices, CustomService};
use crate::state::StateService;
use chrono::Utc;
use futures::FutureExt;
use listeners::{AppAboutToUnloadListener, AppLoadedListener, PageReloadListener};
use modal::{ModalOverlay, ModalStack, OpenModal};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::AppEntry;

/// Everything the app service is wired to
pub struct AppServiceContext {
    pub globals: PortalGlobals,
    pub config: ClientConfig,
    pub host: HostEnvironment,
    pub http: reqwest::Client,
    pub rest: RestClient,
    pub message_bus: MessageBus,
    pub state: StateService,
    pub logger: RemoteLogger,
    pub bootstrap: BootstrapRegistry,
    pub custom_services: HashMap<String, CustomService>,
}

struct ServiceInner {
    api_path: String,
    page_id: String,
    dev_mode: bool,
    config: ClientConfig,
    host: HostEnvironment,
    http: reqwest::Client,
    rest: RestClient,
    resources: ResourceManager,
    bootstrap: BootstrapRegistry,
    message_bus: MessageBus,
    state: StateService,
    logger: RemoteLogger,
    custom_services: Arc<HashMap<String, CustomService>>,
    templates: Templates,
    /// Loaded apps in load order
    registry: Mutex<Vec<AppEntry>>,
    modals: Mutex<ModalStack>,
    /// Setups rendered into the page, consumed by the first load of the instance
    preloaded: Mutex<HashMap<String, AppSetup>>,
    prefetched: Mutex<HashSet<String>>,
    generation: AtomicU64,
    loaded_listeners: ObserverList<dyn Fn(&LoadedApp) + Send + Sync>,
    unload_listeners: ObserverList<dyn Fn(&LoadedApp) + Send + Sync>,
    page_reload_listeners: ObserverList<dyn Fn() + Send + Sync>,
    dev_watch: Mutex<Option<CancellationToken>>,
}

/// The portal app service.
///
/// Owns the registry of loaded app instances and the modal stack. Cloning is
/// cheap and shares all state.
#[derive(Clone)]
pub struct PortalAppService {
    inner: Arc<ServiceInner>,
}

/// Non-owning handle used by background tasks
#[derive(Clone)]
pub struct WeakPortalAppService(Weak<ServiceInner>);

impl WeakPortalAppService {
    pub fn upgrade(&self) -> Option<PortalAppService> {
        self.0.upgrade().map(|inner| PortalAppService { inner })
    }
}

fn prefetch_owner(plugin_name: &str) -> AppId {
    AppId::from(format!("prefetch:{}", plugin_name))
}

impl PortalAppService {
    pub fn new(ctx: AppServiceContext) -> Self {
        let resources = ResourceManager::new(ctx.host.dom.clone(), ctx.host.loader.clone());
        let templates = Templates::new(
            ctx.globals.app_wrapper_template.as_deref(),
            ctx.globals.app_error_template.as_deref(),
        );
        Self {
            inner: Arc::new(ServiceInner {
                api_path: ctx.globals.api_path.clone(),
                page_id: ctx.globals.page_id.clone(),
                dev_mode: ctx.globals.dev_mode,
                config: ctx.config,
                host: ctx.host,
                http: ctx.http,
                rest: ctx.rest,
                resources,
                bootstrap: ctx.bootstrap,
                message_bus: ctx.message_bus,
                state: ctx.state,
                logger: ctx.logger,
                custom_services: Arc::new(ctx.custom_services),
                templates,
                registry: Mutex::new(Vec::new()),
                modals: Mutex::new(ModalStack::default()),
                preloaded: Mutex::new(ctx.globals.preloaded_app_setup),
                prefetched: Mutex::new(HashSet::new()),
                generation: AtomicU64::new(0),
                loaded_listeners: ObserverList::new("app loaded"),
                unload_listeners: ObserverList::new("app about to unload"),
                page_reload_listeners: ObserverList::new("page reload"),
                dev_watch: Mutex::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakPortalAppService {
        WeakPortalAppService(Arc::downgrade(&self.inner))
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.inner.resources
    }

    pub fn bootstrap_registry(&self) -> &BootstrapRegistry {
        &self.inner.bootstrap
    }

    fn dom(&self) -> &dyn Dom {
        self.inner.host.dom.as_ref()
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    // ========================================================================
    // Registry queries
    // ========================================================================

    /// Snapshot of all loaded apps in load order
    pub fn loaded_apps(&self) -> Vec<LoadedApp> {
        self.inner.registry.lock().iter().map(|e| e.app.clone()).collect()
    }

    pub fn find_loaded_app(&self, id: &AppId) -> Option<LoadedApp> {
        self.with_entry(id, |e| e.app.clone())
    }

    /// Ids of the open modal apps, top of the stack last
    pub fn open_modals(&self) -> Vec<AppId> {
        self.inner.modals.lock().app_ids()
    }

    fn with_entry<R>(&self, id: &AppId, f: impl FnOnce(&mut AppEntry) -> R) -> Option<R> {
        self.inner
            .registry
            .lock()
            .iter_mut()
            .find(|e| &e.app.id == id)
            .map(f)
    }

    /// Run `f` only if no newer load/reload of the entry started meanwhile
    fn with_current_entry<R>(&self, id: &AppId, generation: u64, f: impl FnOnce(&mut AppEntry) -> R) -> Option<R> {
        self.with_entry(id, |e| (e.generation == generation).then(|| f(e)))
            .flatten()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load an app into the element with id `host_element_id`.
    ///
    /// Only fails if `(plugin_name, instance_id)` is already loaded. Setup,
    /// resource and bootstrap failures leave the app in error state with the
    /// error placeholder rendered; the call still succeeds.
    pub async fn load_app(
        &self,
        host_element_id: &str,
        plugin_name: &str,
        instance_id: Option<&str>,
        position: Option<usize>,
        override_app_config: Option<Value>,
    ) -> Result<LoadedApp> {
        let id = AppId::generate();
        let generation = self.next_generation();
        {
            let mut registry = self.inner.registry.lock();
            if let Some(instance_id) = instance_id {
                if registry
                    .iter()
                    .any(|e| e.app.plugin_name == plugin_name && e.app.instance_id.as_deref() == Some(instance_id))
                {
                    return Err(PortalError::AppAlreadyLoaded {
                        plugin_name: plugin_name.to_string(),
                        instance_id: instance_id.to_string(),
                    });
                }
            }

            let dom = self.dom();
            let area = match dom.element_by_id(host_element_id) {
                Some(area) => area,
                None => {
                    self.inner.logger.error(
                        &format!("Host element {} not found, mounting {} into body", host_element_id, plugin_name),
                        None,
                    );
                    dom.body()
                }
            };
            let wrapper = self.create_wrapper(&id, plugin_name, plugin_name);
            dom.insert_child(area, wrapper.wrapper, position);

            registry.push(AppEntry {
                app: LoadedApp {
                    id: id.clone(),
                    plugin_name: plugin_name.to_string(),
                    instance_id: instance_id.map(str::to_string),
                    title: None,
                    app_setup: None,
                    loaded_ts: Utc::now(),
                    portal_app_area_id: host_element_id.to_string(),
                    portal_app_wrapper_element: wrapper.wrapper,
                    portal_app_host_element: wrapper.host,
                    portal_app_title_element: wrapper.title,
                    modal: false,
                    error: false,
                    error_plugin_missing: false,
                },
                hooks: None,
                override_config: override_app_config.clone(),
                generation,
            });
        }

        info!(app_id = %id, plugin_name, instance_id = ?instance_id, "Loading app");
        Ok(self.start_app(&id, generation, override_app_config).await)
    }

    /// Load an app into the modal overlay on top of any open modal.
    ///
    /// `on_close` replaces the default of unloading the app on close.
    pub async fn load_app_modal(
        &self,
        plugin_name: &str,
        title: Option<&str>,
        override_app_config: Option<Value>,
        on_close: Option<ModalCloseCallback>,
    ) -> Result<LoadedApp> {
        let dom = self.dom();
        let overlay = ModalOverlay::find(dom)?;
        let id = AppId::generate();
        let generation = self.next_generation();
        let title = title.unwrap_or(plugin_name).to_string();

        let wrapper = self.create_wrapper(&id, plugin_name, &title);
        dom.insert_child(overlay.app_area, wrapper.wrapper, None);

        self.inner.registry.lock().push(AppEntry {
            app: LoadedApp {
                id: id.clone(),
                plugin_name: plugin_name.to_string(),
                instance_id: None,
                title: Some(title.clone()),
                app_setup: None,
                loaded_ts: Utc::now(),
                portal_app_area_id: MODAL_OVERLAY_APP_ID.to_string(),
                portal_app_wrapper_element: wrapper.wrapper,
                portal_app_host_element: wrapper.host,
                portal_app_title_element: wrapper.title,
                modal: true,
                error: false,
                error_plugin_missing: false,
            },
            hooks: None,
            override_config: override_app_config.clone(),
            generation,
        });
        self.inner.modals.lock().push(
            dom,
            &overlay,
            OpenModal {
                app_id: id.clone(),
                wrapper: wrapper.wrapper,
                title,
                on_close,
            },
        );

        info!(app_id = %id, plugin_name, "Loading modal app");
        Ok(self.start_app(&id, generation, override_app_config).await)
    }

    fn create_wrapper(&self, id: &AppId, plugin_name: &str, title: &str) -> crate::host::WrapperElements {
        let dom = self.dom();
        let html = self.inner.templates.render_wrapper(id.as_str(), plugin_name, title);
        let wrapper = dom.create_app_wrapper(&html, &templates::wrapper_dom_id(id.as_str()));
        dom.add_class(wrapper.wrapper, templates::LOADING_CLASS);
        if let Some(title_el) = wrapper.title {
            dom.set_text(title_el, title);
        }
        wrapper
    }

    /// Fetch setup, load resources and bootstrap. Errors end in error state.
    async fn start_app(&self, id: &AppId, generation: u64, override_app_config: Option<Value>) -> LoadedApp {
        match self.try_start_app(id, generation, override_app_config).await {
            Ok(()) => {}
            Err(e) => self.show_load_error(id, generation, &e),
        }
        self.ensure_dev_watch();
        self.find_loaded_app(id).unwrap_or_else(|| {
            // Unloaded while starting; report what was last known
            LoadedApp {
                id: id.clone(),
                plugin_name: String::new(),
                instance_id: None,
                title: None,
                app_setup: None,
                loaded_ts: Utc::now(),
                portal_app_area_id: String::new(),
                portal_app_wrapper_element: self.dom().body(),
                portal_app_host_element: self.dom().body(),
                portal_app_title_element: None,
                modal: false,
                error: true,
                error_plugin_missing: false,
            }
        })
    }

    async fn try_start_app(&self, id: &AppId, generation: u64, override_app_config: Option<Value>) -> Result<()> {
        let Some((plugin_name, instance_id)) =
            self.with_entry(id, |e| (e.app.plugin_name.clone(), e.app.instance_id.clone()))
        else {
            return Ok(());
        };

        let mut setup = self.fetch_app_setup(&plugin_name, instance_id.as_deref()).await?;
        if setup.plugin_missing {
            self.with_current_entry(id, generation, |e| e.app.error_plugin_missing = true);
            return Err(PortalError::PluginMissing(plugin_name));
        }
        setup.app_config = merge_app_config(&setup.app_config, override_app_config.as_ref());

        let installed = self.with_current_entry(id, generation, |e| {
            if !e.app.modal || e.app.title.is_none() {
                e.app.title = setup.title.clone().or_else(|| Some(setup.plugin_name.clone()));
            }
            e.app.app_setup = Some(setup.clone());
            (e.app.portal_app_title_element, e.app.title.clone(), e.app.portal_app_host_element)
        });
        let Some((title_el, title, host_el)) = installed else {
            debug!(app_id = %id, "Setup superseded by a newer load");
            return Ok(());
        };
        if let (Some(el), Some(title)) = (title_el, title) {
            self.dom().set_text(el, &title);
        }

        self.load_resources(id, &setup).await;
        if self.with_entry(id, |_| ()).is_none() {
            // Unloaded while scripts were loading; drop what was attached since
            debug!(app_id = %id, "App unloaded during resource loading");
            self.inner.resources.unload_app_resources(id);
            return Ok(());
        }
        self.release_prefetched(&plugin_name);

        let launch = self
            .inner
            .bootstrap
            .get(&setup.global_launch_function)
            .ok_or_else(|| PortalError::LaunchFunctionMissing(setup.global_launch_function.clone()))?;

        if self.with_current_entry(id, generation, |_| ()).is_none() {
            debug!(app_id = %id, "Load superseded before bootstrap");
            return Ok(());
        }

        let services = self.client_services().scoped(id, &plugin_name);
        let host = AppHost {
            element: host_el,
            dom: self.inner.host.dom.clone(),
        };
        let hooks = bootstrap::invoke(launch, host, setup, services)
            .await
            .map_err(|e| PortalError::Bootstrap {
                plugin_name: plugin_name.clone(),
                message: format!("{:#}", e),
            })?;

        let snapshot = self.with_current_entry(id, generation, |e| {
            e.hooks = hooks;
            e.app.error = false;
            e.app.loaded_ts = Utc::now();
            e.app.clone()
        });
        let Some(app) = snapshot else {
            debug!(app_id = %id, "Bootstrap result superseded by a newer load");
            return Ok(());
        };

        self.dom().remove_class(app.portal_app_wrapper_element, templates::LOADING_CLASS);
        info!(app_id = %id, plugin_name = %app.plugin_name, "App started");
        self.inner.loaded_listeners.notify(|l| l(&app));
        Ok(())
    }

    fn show_load_error(&self, id: &AppId, generation: u64, err: &PortalError) {
        let Some(app) = self.with_current_entry(id, generation, |e| {
            e.app.error = true;
            if matches!(err, PortalError::PluginMissing(_)) {
                e.app.error_plugin_missing = true;
            }
            e.app.clone()
        }) else {
            return;
        };

        let title = app.title.clone().unwrap_or_else(|| app.plugin_name.clone());
        let html = self
            .inner
            .templates
            .render_error(id.as_str(), &app.plugin_name, &title, &err.to_user_string());
        let dom = self.dom();
        dom.set_inner_html(app.portal_app_host_element, &html);
        dom.remove_class(app.portal_app_wrapper_element, templates::LOADING_CLASS);
        dom.add_class(app.portal_app_wrapper_element, templates::ERROR_CLASS);

        self.inner
            .logger
            .scoped(&app.plugin_name)
            .error(&format!("Loading app {} failed", app.plugin_name), Some(err));
    }

    async fn fetch_app_setup(&self, plugin_name: &str, instance_id: Option<&str>) -> Result<AppSetup> {
        if let Some(instance_id) = instance_id {
            if let Some(setup) = self.inner.preloaded.lock().remove(instance_id) {
                debug!(plugin_name, instance_id, "Using preloaded app setup");
                return Ok(setup);
            }
        }

        let mut path = format!(
            "/pages/{}/portal-app-instances/{}",
            urlencoding::encode(&self.inner.page_id),
            urlencoding::encode(plugin_name)
        );
        if let Some(instance_id) = instance_id {
            path.push('/');
            path.push_str(&urlencoding::encode(instance_id));
        }

        let timeout = self.inner.config.app_setup_timeout();
        match tokio::time::timeout(timeout, self.inner.rest.get::<AppSetup>(&path)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RestError::new(0, format!("loading app setup timed out after {:?}", timeout)).into()),
        }
    }

    /// CSS is attached without waiting. JS loads strictly in order, shared first.
    async fn load_resources(&self, owner: &AppId, setup: &AppSetup) {
        let resources = &self.inner.resources;
        for url in self.style_urls(setup) {
            resources.load_style(&url, owner);
        }
        for url in self.script_urls(setup) {
            resources.load_js(&url, owner).await;
        }
    }

    fn shared_urls(&self, setup: &AppSetup, folder: &str, files: impl Fn(&AppResources) -> &Vec<String>) -> Vec<String> {
        let (Some(base), Some(shared)) = (&setup.shared_resources_base_path, &setup.shared_resources) else {
            return Vec::new();
        };
        files(shared)
            .iter()
            .map(|f| format!("{}/{}/{}", base.trim_end_matches('/'), folder, f))
            .collect()
    }

    fn app_urls(&self, setup: &AppSetup, files: &[String]) -> Vec<String> {
        let version = if self.inner.dev_mode {
            setup.last_reload_ts.to_string()
        } else {
            setup.version.clone()
        };
        files
            .iter()
            .map(|f| {
                format!(
                    "{}/{}?v={}",
                    setup.resources_base_path.trim_end_matches('/'),
                    f,
                    urlencoding::encode(&version)
                )
            })
            .collect()
    }

    fn script_urls(&self, setup: &AppSetup) -> Vec<String> {
        let mut urls = self.shared_urls(setup, "js", |r| &r.js);
        urls.extend(self.app_urls(setup, &setup.resources.js));
        urls
    }

    fn style_urls(&self, setup: &AppSetup) -> Vec<String> {
        let mut urls = self.shared_urls(setup, "css", |r| &r.css);
        urls.extend(self.app_urls(setup, &setup.resources.css));
        urls
    }

    /// Unscoped services; apps get [`ClientServices::scoped`] copies
    pub fn client_services(&self) -> ClientServices {
        ClientServices::new(
            self.inner.message_bus.clone(),
            self.inner.state.clone(),
            self.inner.logger.clone(),
            self.inner.rest.clone(),
            self.clone(),
            self.inner.custom_services.clone(),
        )
    }

    // ========================================================================
    // Reload, move, unload
    // ========================================================================

    /// Tear down and start the app again in the same place.
    ///
    /// The config override of dynamically loaded apps survives unless a new
    /// one is given.
    pub async fn reload_app(&self, id: &AppId, override_app_config: Option<Value>) -> Result<LoadedApp> {
        let Some((app, hooks)) = self.with_entry(id, |e| (e.app.clone(), e.hooks.take())) else {
            return Err(PortalError::AppNotFound(id.to_string()));
        };
        info!(app_id = %id, plugin_name = %app.plugin_name, "Reloading app");

        self.inner.unload_listeners.notify(|l| l(&app));
        self.call_will_be_removed(&app, hooks).await;
        self.inner.message_bus.unsubscribe_everything_from_app(id);
        self.inner.resources.unload_app_resources(id);

        let generation = self.next_generation();
        let dom = self.dom();
        let title = app.title.clone().unwrap_or_else(|| app.plugin_name.clone());
        let wrapper = self.create_wrapper(id, &app.plugin_name, &title);
        let old = app.portal_app_wrapper_element;
        let parent = dom.parent_of(old).unwrap_or_else(|| dom.body());
        let index = dom.index_in_parent(old);
        dom.remove(old);
        dom.insert_child(parent, wrapper.wrapper, index);

        let override_app_config = self.with_entry(id, |e| {
            e.generation = generation;
            e.hooks = None;
            e.app.portal_app_wrapper_element = wrapper.wrapper;
            e.app.portal_app_host_element = wrapper.host;
            e.app.portal_app_title_element = wrapper.title;
            e.app.error = false;
            e.app.error_plugin_missing = false;
            if override_app_config.is_some() || e.app.instance_id.is_some() {
                e.override_config = override_app_config.clone();
            }
            e.override_config.clone()
        });
        let Some(override_app_config) = override_app_config else {
            // Unloaded while willBeRemoved ran
            dom.remove(wrapper.wrapper);
            return Err(PortalError::AppNotFound(id.to_string()));
        };

        if app.modal {
            self.inner.modals.lock().update_wrapper(dom, id, wrapper.wrapper);
        }

        Ok(self.start_app(id, generation, override_app_config).await)
    }

    /// Remove an app. Unknown ids are logged, not returned as error.
    pub async fn unload_app(&self, id: &AppId) {
        let entry = {
            let mut registry = self.inner.registry.lock();
            registry
                .iter()
                .position(|e| &e.app.id == id)
                .map(|index| registry.remove(index))
        };
        let Some(mut entry) = entry else {
            error!(app_id = %id, "Cannot unload app: not loaded");
            self.inner
                .logger
                .error(&format!("Cannot unload app {}: not loaded", id), None);
            return;
        };
        let app = entry.app.clone();
        info!(app_id = %id, plugin_name = %app.plugin_name, "Unloading app");

        self.inner.unload_listeners.notify(|l| l(&app));
        self.call_will_be_removed(&app, entry.hooks.take()).await;

        let dom = self.dom();
        dom.remove(app.portal_app_wrapper_element);
        self.inner.message_bus.unsubscribe_everything_from_app(id);
        self.inner.resources.unload_app_resources(id);
        if app.modal {
            self.inner.modals.lock().remove(dom, id);
        }
        if self.inner.registry.lock().is_empty() {
            self.stop_dev_watch();
        }
    }

    /// Move the wrapper to another area without restarting the app
    pub fn move_app(&self, id: &AppId, new_area_id: &str, new_position: Option<usize>) -> Result<()> {
        let Some(app) = self.find_loaded_app(id) else {
            error!(app_id = %id, "Cannot move app: not loaded");
            return Err(PortalError::AppNotFound(id.to_string()));
        };
        let dom = self.dom();
        let Some(area) = dom.element_by_id(new_area_id) else {
            error!(app_id = %id, area = new_area_id, "Cannot move app: area not found");
            return Err(PortalError::AreaNotFound(new_area_id.to_string()));
        };

        self.inner.unload_listeners.notify(|l| l(&app));
        dom.insert_child(area, app.portal_app_wrapper_element, new_position);
        let moved = self.with_entry(id, |e| {
            e.app.portal_app_area_id = new_area_id.to_string();
            e.app.clone()
        });
        if let Some(moved) = moved {
            debug!(app_id = %id, area = new_area_id, "App moved");
            self.inner.loaded_listeners.notify(|l| l(&moved));
        }
        Ok(())
    }

    async fn call_will_be_removed(&self, app: &LoadedApp, hooks: Option<LifecycleHooks>) {
        let Some(hook) = hooks.and_then(|h| h.will_be_removed) else {
            return;
        };
        let result = match catch_unwind(AssertUnwindSafe(|| hook())) {
            Err(_) => Err(anyhow::anyhow!("willBeRemoved panicked")),
            Ok(Err(e)) => Err(e),
            Ok(Ok(HookOutcome::Done)) => Ok(()),
            Ok(Ok(HookOutcome::Pending(fut))) => AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("willBeRemoved panicked"))),
        };
        if let Err(e) = result {
            warn!(app_id = %app.id, plugin_name = %app.plugin_name, error = %e, "willBeRemoved failed");
            self.inner
                .logger
                .scoped(&app.plugin_name)
                .warn(&format!("willBeRemoved of {} failed: {:#}", app.plugin_name, e));
        }
    }

    // ========================================================================
    // Modals and keys
    // ========================================================================

    pub async fn handle_key(&self, key: Key) {
        if key == Key::Escape {
            self.close_modal().await;
        }
    }

    /// Close the top modal: call its `on_close`, else unload it
    pub async fn close_modal(&self) {
        let top = {
            let mut modals = self.inner.modals.lock();
            let Some(id) = modals.top().map(|m| m.app_id.clone()) else {
                return;
            };
            modals.remove(self.dom(), &id)
        };
        let Some(top) = top else {
            return;
        };
        self.dom().set_visible(top.wrapper, false);

        match top.on_close {
            Some(on_close) => {
                if let Some(app) = self.find_loaded_app(&top.app_id) {
                    if catch_unwind(AssertUnwindSafe(|| on_close(&app))).is_err() {
                        error!(app_id = %top.app_id, "Modal onClose callback panicked");
                    }
                }
            }
            None => self.unload_app(&top.app_id).await,
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn register_app_loaded_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&LoadedApp) + Send + Sync + 'static,
    {
        let listener: AppLoadedListener = Arc::new(listener);
        self.inner.loaded_listeners.register(listener)
    }

    pub fn unregister_app_loaded_listener(&self, token: ListenerToken) -> bool {
        self.inner.loaded_listeners.unregister(token)
    }

    pub fn register_app_about_to_unload_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&LoadedApp) + Send + Sync + 'static,
    {
        let listener: AppAboutToUnloadListener = Arc::new(listener);
        self.inner.unload_listeners.register(listener)
    }

    pub fn unregister_app_about_to_unload_listener(&self, token: ListenerToken) -> bool {
        self.inner.unload_listeners.unregister(token)
    }

    /// Notified in dev mode when the theme or a layout changed on the server
    pub fn register_page_reload_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener: PageReloadListener = Arc::new(listener);
        self.inner.page_reload_listeners.register(listener)
    }

    pub fn unregister_page_reload_listener(&self, token: ListenerToken) -> bool {
        self.inner.page_reload_listeners.unregister(token)
    }

    // ========================================================================
    // App catalog, prefetch and config updates
    // ========================================================================

    pub async fn available_apps(&self) -> Result<Vec<AvailableApp>> {
        Ok(self.inner.rest.get("/portal-apps").await?)
    }

    /// Plugin names of loaded apps that changed on the server since they were loaded
    pub async fn check_loaded_apps_updated(&self) -> Result<Vec<String>> {
        let loaded: Vec<(String, i64)> = self
            .inner
            .registry
            .lock()
            .iter()
            .filter_map(|e| {
                e.app
                    .app_setup
                    .as_ref()
                    .map(|s| (e.app.plugin_name.clone(), s.last_reload_ts))
            })
            .collect();
        let Some(since) = loaded.iter().map(|(_, ts)| *ts).min() else {
            return Ok(Vec::new());
        };

        let updated: Vec<AvailableApp> = self
            .inner
            .rest
            .get(&format!("/portal-apps?updatedSince={}", since))
            .await?;

        let mut names: Vec<String> = Vec::new();
        for app in updated {
            let stale = loaded
                .iter()
                .any(|(name, ts)| *name == app.name && *ts < app.last_reload_ts);
            if stale && !names.contains(&app.name) {
                names.push(app.name);
            }
        }
        Ok(names)
    }

    /// Warm the resources of `plugin_name` without mounting it
    pub async fn prefetch_resources(&self, plugin_name: &str) -> Result<()> {
        let setup = self.fetch_app_setup(plugin_name, None).await?;
        if setup.plugin_missing {
            return Err(PortalError::PluginMissing(plugin_name.to_string()));
        }
        self.inner.prefetched.lock().insert(plugin_name.to_string());
        self.load_resources(&prefetch_owner(plugin_name), &setup).await;
        debug!(plugin_name, "Prefetched app resources");
        Ok(())
    }

    /// Drop the references a prefetch holds
    pub fn release_prefetched(&self, plugin_name: &str) {
        if self.inner.prefetched.lock().remove(plugin_name) {
            self.inner.resources.unload_app_resources(&prefetch_owner(plugin_name));
        }
    }

    /// Hand a new config to the app's `updateAppConfig` hook, or reload it
    /// with the config as override if it has none.
    pub async fn update_app_config(&self, id: &AppId, app_config: Value) -> Result<LoadedApp> {
        let Some((hook, current, previous_override)) = self.with_entry(id, |e| {
            (
                e.hooks.as_ref().and_then(|h| h.update_app_config.clone()),
                e.app.app_config().cloned(),
                e.override_config.clone(),
            )
        }) else {
            return Err(PortalError::AppNotFound(id.to_string()));
        };

        let combined_override = merge_app_config(
            &previous_override.unwrap_or_else(|| Value::Object(Map::new())),
            Some(&app_config),
        );

        let Some(hook) = hook else {
            return self.reload_app(id, Some(combined_override)).await;
        };

        let merged = merge_app_config(&current.unwrap_or_else(|| Value::Object(Map::new())), Some(&app_config));
        match catch_unwind(AssertUnwindSafe(|| hook(merged.clone()))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(PortalError::Bootstrap {
                    plugin_name: self.find_loaded_app(id).map(|a| a.plugin_name).unwrap_or_default(),
                    message: format!("updateAppConfig failed: {:#}", e),
                });
            }
            Err(_) => {
                return Err(PortalError::Bootstrap {
                    plugin_name: self.find_loaded_app(id).map(|a| a.plugin_name).unwrap_or_default(),
                    message: "updateAppConfig panicked".to_string(),
                });
            }
        }

        self.with_entry(id, |e| {
            if let Some(setup) = e.app.app_setup.as_mut() {
                setup.app_config = merged;
            }
            e.override_config = Some(combined_override);
            e.app.clone()
        })
        .ok_or_else(|| PortalError::AppNotFound(id.to_string()))
    }

    // ========================================================================
    // Dev mode
    // ========================================================================

    pub(crate) async fn handle_plugin_update(&self, event: PluginUpdateEvent) {
        match event {
            PluginUpdateEvent::App(update) => {
                let ids: Vec<AppId> = self
                    .loaded_apps()
                    .into_iter()
                    .filter(|a| a.plugin_name == update.plugin_name)
                    .map(|a| a.id)
                    .collect();
                if ids.is_empty() {
                    return;
                }
                info!(plugin_name = %update.plugin_name, count = ids.len(), "App updated on server, reloading");
                for id in ids {
                    if let Err(e) = self.reload_app(&id, None).await {
                        warn!(app_id = %id, error = %e, "Reloading updated app failed");
                    }
                }
            }
            PluginUpdateEvent::Theme(_) | PluginUpdateEvent::Layout(_) => {
                info!("Theme or layout updated on server");
                self.inner.page_reload_listeners.notify(|l| l());
            }
        }
    }

    fn ensure_dev_watch(&self) {
        if !self.inner.dev_mode || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let mut watch = self.inner.dev_watch.lock();
        if watch.is_some() {
            return;
        }
        let url = format!(
            "{}{}",
            self.inner.api_path.trim_end_matches('/'),
            watch::PUSH_PLUGIN_UPDATES_PATH
        );
        debug!(url = %url, "Starting dev mode app update watch");
        *watch = Some(watch::start(
            self.downgrade(),
            self.inner.http.clone(),
            url,
            self.inner.config.dev_poll_interval(),
        ));
    }

    fn stop_dev_watch(&self) {
        if let Some(token) = self.inner.dev_watch.lock().take() {
            token.cancel();
        }
    }

    /// Stop background work owned by the service
    pub fn shutdown(&self) {
        self.stop_dev_watch();
    }

    #[cfg(test)]
    fn element_of(&self, id: &AppId) -> Option<crate::host::ElementId> {
        self.find_loaded_app(id).map(|a| a.portal_app_wrapper_element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{
        Location, MemoryStorage, ResourceKind, ResourceLoadError, ResourceLoader, VirtualDom,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct RecordingLoader {
        calls: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResourceLoader for RecordingLoader {
        async fn load(&self, _kind: ResourceKind, url: &str) -> std::result::Result<(), ResourceLoadError> {
            self.calls.lock().push(url.to_string());
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(())
        }
    }

    fn service(preloaded: Vec<AppSetup>) -> (Arc<VirtualDom>, PortalAppService) {
        let dom = Arc::new(VirtualDom::new());
        dom.create_element("area", None);
        let location = Arc::new(Location::parse("http://localhost/portal/web/home").unwrap());
        let host = HostEnvironment {
            dom: dom.clone(),
            loader: Arc::new(RecordingLoader {
                calls: parking_lot::Mutex::new(Vec::new()),
            }),
            location: location.clone(),
            session_storage: Arc::new(MemoryStorage::new()),
            local_storage: Arc::new(MemoryStorage::new()),
        };
        let http = reqwest::Client::new();
        // Nothing listens on port 9, so setups must come from the preloaded map
        let rest = RestClient::new(http.clone(), "http://127.0.0.1:9/api", None);
        let config = ClientConfig {
            app_setup_timeout_ms: 500,
            ..Default::default()
        };
        let logger = RemoteLogger::new(rest.clone(), location.clone(), &config);
        let mut globals = PortalGlobals {
            api_path: "http://127.0.0.1:9/api".into(),
            page_id: "home".into(),
            ..Default::default()
        };
        for setup in preloaded {
            if let Some(instance_id) = setup.instance_id.clone() {
                globals.preloaded_app_setup.insert(instance_id, setup);
            }
        }
        let service = PortalAppService::new(AppServiceContext {
            globals,
            config,
            host: host.clone(),
            http,
            rest,
            message_bus: MessageBus::new(None, None),
            state: StateService::new(location, host.session_storage.clone(), host.local_storage.clone()),
            logger,
            bootstrap: BootstrapRegistry::new(),
            custom_services: HashMap::new(),
        });
        (dom, service)
    }

    fn setup(plugin: &str, instance: &str) -> AppSetup {
        let mut setup = AppSetup::new(plugin, "start");
        setup.instance_id = Some(instance.to_string());
        setup.title = Some(format!("{plugin} title"));
        setup
    }

    #[tokio::test]
    async fn test_duplicate_instance_is_rejected() {
        let (_dom, service) = service(vec![setup("Demo", "i1")]);
        service.bootstrap_registry().register("start", |_, _, _| Ok(BootstrapOutcome::none()));

        let app = service.load_app("area", "Demo", Some("i1"), None, None).await.unwrap();
        assert!(!app.error);
        let dup = service.load_app("area", "Demo", Some("i1"), None, None).await;
        assert!(matches!(dup, Err(PortalError::AppAlreadyLoaded { .. })));
        assert_eq!(service.loaded_apps().len(), 1);
    }

    #[tokio::test]
    async fn test_setup_fetch_failure_ends_in_error_state() {
        let (dom, service) = service(vec![]);
        let app = service.load_app("area", "Unknown", None, None, None).await.unwrap();
        assert!(app.error);
        let html = dom.inner_html(app.portal_app_host_element).unwrap();
        assert!(html.contains("portal-app-loading-error"));
        assert!(dom.has_class(app.portal_app_wrapper_element, templates::ERROR_CLASS));
    }

    #[tokio::test]
    async fn test_plugin_missing() {
        let mut missing = setup("Gone", "i9");
        missing.plugin_missing = true;
        let (dom, service) = service(vec![missing]);
        let app = service.load_app("area", "Gone", Some("i9"), None, None).await.unwrap();
        assert!(app.error);
        assert!(app.error_plugin_missing);
        assert!(dom
            .inner_html(app.portal_app_host_element)
            .unwrap()
            .contains("App Gone is not available"));
    }

    #[tokio::test]
    async fn test_missing_area_mounts_into_body() {
        let (dom, service) = service(vec![setup("Demo", "i1")]);
        service.bootstrap_registry().register("start", |_, _, _| Ok(BootstrapOutcome::none()));
        let app = service.load_app("nope", "Demo", Some("i1"), None, None).await.unwrap();
        assert_eq!(dom.parent_of(app.portal_app_wrapper_element), Some(dom.body()));
    }

    #[tokio::test]
    async fn test_reload_keeps_position_and_calls_hook() {
        let (dom, service) = service(vec![setup("A", "a"), setup("B", "b")]);
        let removed = Arc::new(parking_lot::Mutex::new(0));
        let counter = removed.clone();
        service.bootstrap_registry().register("start", move |_, _, _| {
            let counter = counter.clone();
            Ok(BootstrapOutcome::hooks(LifecycleHooks::default().on_will_be_removed(move || {
                *counter.lock() += 1;
                Ok(HookOutcome::Done)
            })))
        });

        let a = service.load_app("area", "A", Some("a"), None, None).await.unwrap();
        let b = service.load_app("area", "B", Some("b"), None, None).await.unwrap();
        let area = dom.element_by_id("area").unwrap();
        assert_eq!(dom.index_in_parent(a.portal_app_wrapper_element), Some(0));

        // Setup is gone from the preloaded map, so the reload fetch fails
        let reloaded = service.reload_app(&a.id, None).await.unwrap();
        assert_eq!(*removed.lock(), 1);
        assert_ne!(reloaded.portal_app_wrapper_element, a.portal_app_wrapper_element);
        assert!(!dom.is_attached(a.portal_app_wrapper_element));
        assert_eq!(dom.children(area)[0], reloaded.portal_app_wrapper_element);
        assert_eq!(dom.children(area)[1], b.portal_app_wrapper_element);
        assert_eq!(service.element_of(&a.id), Some(reloaded.portal_app_wrapper_element));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let (_dom, service) = service(vec![]);
        let id = AppId::from("X");
        service.unload_app(&id).await;
        assert!(matches!(service.reload_app(&id, None).await, Err(PortalError::AppNotFound(_))));
        assert!(matches!(service.move_app(&id, "area", None), Err(PortalError::AppNotFound(_))));
    }

    #[tokio::test]
    async fn test_update_app_config_uses_hook() {
        let (_dom, service) = service(vec![setup("A", "a")]);
        let received = Arc::new(parking_lot::Mutex::new(None));
        let sink = received.clone();
        service.bootstrap_registry().register("start", move |_, _, _| {
            let sink = sink.clone();
            Ok(BootstrapOutcome::hooks(LifecycleHooks::default().on_update_app_config(
                move |config| {
                    *sink.lock() = Some(config);
                    Ok(())
                },
            )))
        });

        let app = service.load_app("area", "A", Some("a"), None, Some(json!({"x": 1}))).await.unwrap();
        let updated = service.update_app_config(&app.id, json!({"y": 2})).await.unwrap();
        assert_eq!(*received.lock(), Some(json!({"x": 1, "y": 2})));
        assert_eq!(updated.app_config(), Some(&json!({"x": 1, "y": 2})));
        assert_eq!(updated.id, app.id);
    }

    #[tokio::test]
    async fn test_bootstrap_panic_is_contained() {
        let (_dom, service) = service(vec![setup("A", "a")]);
        service
            .bootstrap_registry()
            .register("start", |_, _, _| panic!("app bundle is broken"));
        let app = service.load_app("area", "A", Some("a"), None, None).await.unwrap();
        assert!(app.error);
    }

    #[tokio::test]
    async fn test_app_update_reloads_instances_of_that_plugin_only() {
        let (dom, service) = service(vec![setup("A", "a1"), setup("A", "a2"), setup("B", "b")]);
        service.bootstrap_registry().register("start", |_, _, _| Ok(BootstrapOutcome::none()));
        let a1 = service.load_app("area", "A", Some("a1"), None, None).await.unwrap();
        let a2 = service.load_app("area", "A", Some("a2"), None, None).await.unwrap();
        let b = service.load_app("area", "B", Some("b"), None, None).await.unwrap();

        service
            .handle_plugin_update(PluginUpdateEvent::App(watch::AppUpdate {
                plugin_name: "A".to_string(),
            }))
            .await;

        assert_ne!(service.element_of(&a1.id), Some(a1.portal_app_wrapper_element));
        assert_ne!(service.element_of(&a2.id), Some(a2.portal_app_wrapper_element));
        assert_eq!(service.element_of(&b.id), Some(b.portal_app_wrapper_element));
        assert!(dom.is_attached(b.portal_app_wrapper_element));
        assert_eq!(service.loaded_apps().len(), 3);
    }

    #[tokio::test]
    async fn test_theme_and_layout_updates_notify_page_reload_listeners() {
        let (_dom, service) = service(vec![]);
        let reloads = Arc::new(parking_lot::Mutex::new(0));
        let counter = reloads.clone();
        let token = service.register_page_reload_listener(move || *counter.lock() += 1);

        service.handle_plugin_update(PluginUpdateEvent::Theme(json!({"name": "dark"}))).await;
        service.handle_plugin_update(PluginUpdateEvent::Layout(json!({}))).await;
        assert_eq!(*reloads.lock(), 2);

        assert!(service.unregister_page_reload_listener(token));
        service.handle_plugin_update(PluginUpdateEvent::Theme(json!({}))).await;
        assert_eq!(*reloads.lock(), 2);
    }

    #[tokio::test]
    async fn test_modal_requires_overlay() {
        let (_dom, service) = service(vec![]);
        let result = service.load_app_modal("A", None, None, None).await;
        assert!(matches!(result, Err(PortalError::ModalOverlayMissing)));
    }
}
