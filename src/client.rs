// src/client.rs
// Entry point wiring every client service for one page session

use crate::app::{AppServiceContext, BootstrapRegistry, PortalAppService};
use crate::config::{ClientConfig, PortalGlobals};
use crate::error::Result;
use crate::host::HostEnvironment;
use crate::http::create_shared_client;
use crate::messaging::{MessageBus, RemoteMessagingClient};
use crate::remote_logger::RemoteLogger;
use crate::rest::RestClient;
use crate::services::{ClientServices, CustomService};
use crate::state::StateService;
use std::collections::HashMap;
use tracing::{info, warn};

/// All client services of a page, built once from the page globals
pub struct PortalClient {
    globals: PortalGlobals,
    config: ClientConfig,
    rest: RestClient,
    remote: Option<RemoteMessagingClient>,
    message_bus: MessageBus,
    state: StateService,
    logger: RemoteLogger,
    app_service: PortalAppService,
}

impl PortalClient {
    pub fn new(globals: PortalGlobals, config: ClientConfig, host: HostEnvironment) -> Self {
        Self::with_custom_services(globals, config, host, HashMap::new())
    }

    /// Config from `PORTAL_RUNTIME_CONFIG`, globals from the page's JSON
    pub fn from_globals_json(json: &str, host: HostEnvironment) -> Result<Self> {
        let globals = PortalGlobals::from_json(json)?;
        Ok(Self::new(globals, ClientConfig::from_env(), host))
    }

    /// `globals_by_name` holds host-provided services by global name; the
    /// page's `portalCustomClientServices` maps service keys to those names.
    pub fn with_custom_services(
        globals: PortalGlobals,
        config: ClientConfig,
        host: HostEnvironment,
        globals_by_name: HashMap<String, CustomService>,
    ) -> Self {
        let http = create_shared_client();
        let rest = RestClient::new(http.clone(), globals.api_path.clone(), globals.csrf_token.clone());

        let remote = globals.remote_messaging_connect_url.as_ref().map(|url| {
            RemoteMessagingClient::new(url.clone(), host.session_storage.clone(), config.clone())
        });
        let message_bus = MessageBus::new(
            remote.clone(),
            globals.remote_messaging_private_user_topic.clone(),
        );
        let state = StateService::new(
            host.location.clone(),
            host.session_storage.clone(),
            host.local_storage.clone(),
        );
        let logger = RemoteLogger::new(rest.clone(), host.location.clone(), &config);

        let mut custom_services = HashMap::new();
        for (key, global_name) in &globals.custom_client_services {
            match globals_by_name.get(global_name) {
                Some(service) => {
                    custom_services.insert(key.clone(), service.clone());
                }
                None => warn!(key = %key, global = %global_name, "Custom client service not provided"),
            }
        }

        let app_service = PortalAppService::new(AppServiceContext {
            globals: globals.clone(),
            config: config.clone(),
            host,
            http,
            rest: rest.clone(),
            message_bus: message_bus.clone(),
            state: state.clone(),
            logger: logger.clone(),
            bootstrap: BootstrapRegistry::new(),
            custom_services,
        });

        info!(
            page_id = %globals.page_id,
            dev_mode = globals.dev_mode,
            remote_messaging = remote.is_some(),
            "Portal client services ready"
        );

        Self {
            globals,
            config,
            rest,
            remote,
            message_bus,
            state,
            logger,
            app_service,
        }
    }

    pub fn globals(&self) -> &PortalGlobals {
        &self.globals
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn app_service(&self) -> &PortalAppService {
        &self.app_service
    }

    pub fn bootstrap_registry(&self) -> &BootstrapRegistry {
        self.app_service.bootstrap_registry()
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.message_bus
    }

    pub fn state_service(&self) -> &StateService {
        &self.state
    }

    pub fn remote_logger(&self) -> &RemoteLogger {
        &self.logger
    }

    pub fn rest_client(&self) -> &RestClient {
        &self.rest
    }

    pub fn remote_messaging(&self) -> Option<&RemoteMessagingClient> {
        self.remote.as_ref()
    }

    /// Unscoped services, as the page itself sees them
    pub fn client_services(&self) -> ClientServices {
        self.app_service.client_services()
    }

    /// The page is going away: no more reconnects, flush pending log entries
    pub async fn page_unload(&self) {
        info!("Page unload");
        if let Some(remote) = &self.remote {
            remote.close();
        }
        self.app_service.shutdown();
        self.logger.page_unload().await;
    }
}
