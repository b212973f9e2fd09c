// src/config/file.rs
// Runtime tunables, optionally loaded from a TOML file

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "PORTAL_RUNTIME_CONFIG";

/// Timeouts, retry budgets and batching limits.
///
/// All durations are milliseconds in the file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a remote command waits for the socket to reach `connected`
    pub remote_ready_timeout_ms: u64,
    /// How often readiness is re-checked while waiting
    pub remote_ready_check_interval_ms: u64,
    /// Deadline for the correlated response of a remote command
    pub remote_command_timeout_ms: u64,
    /// Period of the sweep that expires outstanding commands
    pub remote_sweep_interval_ms: u64,
    /// Reconnect delay grows by this much per attempt
    pub reconnect_base_delay_ms: u64,
    /// Ceiling for the reconnect delay
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts before giving up for good
    pub reconnect_max_attempts: u32,
    pub log_flush_interval_ms: u64,
    pub log_batch_size: usize,
    /// Poll period of the dev-mode update check when no event stream is available
    pub dev_poll_interval_ms: u64,
    pub app_setup_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_ready_timeout_ms: 5_000,
            remote_ready_check_interval_ms: 100,
            remote_command_timeout_ms: 10_000,
            remote_sweep_interval_ms: 1_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 15_000,
            reconnect_max_attempts: 20,
            log_flush_interval_ms: 1_000,
            log_batch_size: 50,
            dev_poll_interval_ms: 3_000,
            app_setup_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Load config from the file named by `PORTAL_RUNTIME_CONFIG`, defaults otherwise
    pub fn from_env() -> Self {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(&PathBuf::from(path.trim())),
            _ => {
                debug!("{} not set, using default client config", CONFIG_PATH_ENV);
                Self::default()
            }
        }
    }

    /// Load config from a TOML file. Missing or invalid files yield defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded client config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse client config");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Client config not found, using defaults");
                Self::default()
            }
        }
    }

    pub fn remote_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_ready_timeout_ms)
    }

    pub fn remote_ready_check_interval(&self) -> Duration {
        Duration::from_millis(self.remote_ready_check_interval_ms.max(1))
    }

    pub fn remote_command_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_command_timeout_ms)
    }

    pub fn remote_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.remote_sweep_interval_ms.max(1))
    }

    /// Linear backoff: `attempt * base`, capped at the configured ceiling
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(u64::from(attempt.max(1)))
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn dev_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dev_poll_interval_ms.max(1))
    }

    pub fn app_setup_timeout(&self) -> Duration {
        Duration::from_millis(self.app_setup_timeout_ms)
    }
}
