// src/services.rs
// Client services bundle handed to every app's bootstrap function

use crate::app::{AppId, PortalAppService};
use crate::messaging::MessageBus;
use crate::remote_logger::RemoteLogger;
use crate::rest::RestClient;
use crate::state::StateService;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Services provided by the embedding host under a global name
pub type CustomService = Arc<dyn Any + Send + Sync>;

/// The services an app receives.
///
/// Apps get a per-instance copy from [`ClientServices::scoped`]: bus, state
/// and logger are bound to the instance, everything else is shared.
/// Fields are read-only so an app cannot swap services for other apps.
#[derive(Clone)]
pub struct ClientServices {
    message_bus: MessageBus,
    state_service: StateService,
    remote_logger: RemoteLogger,
    rest_client: RestClient,
    portal_app_service: PortalAppService,
    custom: Arc<HashMap<String, CustomService>>,
}

impl ClientServices {
    pub fn new(
        message_bus: MessageBus,
        state_service: StateService,
        remote_logger: RemoteLogger,
        rest_client: RestClient,
        portal_app_service: PortalAppService,
        custom: Arc<HashMap<String, CustomService>>,
    ) -> Self {
        Self {
            message_bus,
            state_service,
            remote_logger,
            rest_client,
            portal_app_service,
            custom,
        }
    }

    /// Copy for one app instance
    pub fn scoped(&self, app_id: &AppId, plugin_name: &str) -> Self {
        Self {
            message_bus: self.message_bus.get_app_instance(app_id),
            state_service: self.state_service.scoped(plugin_name),
            remote_logger: self.remote_logger.scoped(plugin_name),
            ..self.clone()
        }
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.message_bus
    }

    pub fn state_service(&self) -> &StateService {
        &self.state_service
    }

    pub fn remote_logger(&self) -> &RemoteLogger {
        &self.remote_logger
    }

    pub fn rest_client(&self) -> &RestClient {
        &self.rest_client
    }

    pub fn portal_app_service(&self) -> &PortalAppService {
        &self.portal_app_service
    }

    /// Host-provided service registered under `key`, if it has type `T`
    pub fn custom_service<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.custom.get(key).cloned()?.downcast::<T>().ok()
    }

    pub fn custom_service_keys(&self) -> impl Iterator<Item = &str> {
        self.custom.keys().map(String::as_str)
    }
}

impl fmt::Debug for ClientServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientServices")
            .field("app_id", &self.message_bus.app_id())
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}
