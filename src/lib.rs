// src/lib.rs
// Portal runtime - lifecycle, messaging and resources of portal micro-frontend apps

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod http;
pub mod logging;
pub mod messaging;
pub mod remote_logger;
pub mod resource_manager;
pub mod rest;
pub mod services;
pub mod state;

pub use app::{AppId, AppSetup, BootstrapOutcome, LifecycleHooks, LoadedApp, PortalAppService};
pub use client::PortalClient;
pub use error::{PortalError, Result};
pub use messaging::MessageBus;
pub use services::ClientServices;
