// src/remote_logger.rs
// Batches client-side log events and ships them to the server

use crate::config::ClientConfig;
use crate::host::Location;
use crate::rest::{RestClient, RestError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Endpoint receiving batched entries
pub const LOG_PATH: &str = "/log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
}

/// One entry of the `POST /log` payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portal_app_name: Option<String>,
    pub path: String,
    pub message: String,
}

struct LoggerInner {
    rest: RestClient,
    location: Arc<Location>,
    queue: Mutex<Vec<LogEntry>>,
    flush_scheduled: AtomicBool,
    flush_interval: Duration,
    batch_size: usize,
}

/// Remote logger, optionally scoped to an app (entries carry its plugin name)
#[derive(Clone)]
pub struct RemoteLogger {
    inner: Arc<LoggerInner>,
    app_name: Option<String>,
}

impl RemoteLogger {
    pub fn new(rest: RestClient, location: Arc<Location>, config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                rest,
                location,
                queue: Mutex::new(Vec::new()),
                flush_scheduled: AtomicBool::new(false),
                flush_interval: config.log_flush_interval(),
                batch_size: config.log_batch_size.max(1),
            }),
            app_name: None,
        }
    }

    /// A view sharing the queue that stamps entries with `plugin_name`
    pub fn scoped(&self, plugin_name: &str) -> Self {
        Self {
            inner: self.inner.clone(),
            app_name: Some(plugin_name.to_string()),
        }
    }

    pub fn error(&self, message: &str, err: Option<&(dyn std::error::Error + 'static)>) {
        let message = match err {
            Some(err) => format!("{}: {}", message, err),
            None => message.to_string(),
        };
        error!(app = self.app_name.as_deref().unwrap_or("-"), "{}", message);
        self.push(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        warn!(app = self.app_name.as_deref().unwrap_or("-"), "{}", message);
        self.push(LogLevel::Warn, message.to_string());
    }

    pub fn info(&self, message: &str) {
        info!(app = self.app_name.as_deref().unwrap_or("-"), "{}", message);
        self.push(LogLevel::Info, message.to_string());
    }

    /// Entries waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn push(&self, level: LogLevel, message: String) {
        let entry = LogEntry {
            level,
            portal_app_name: self.app_name.clone(),
            path: self.inner.location.path(),
            message,
        };

        let full = {
            let mut queue = self.inner.queue.lock();
            queue.push(entry);
            queue.len() >= self.inner.batch_size
        };

        // Without a runtime entries stay queued until an explicit flush
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        if full {
            let logger = self.clone();
            tokio::spawn(async move {
                let _ = logger.flush().await;
            });
        } else if !self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            let logger = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(logger.inner.flush_interval).await;
                logger.inner.flush_scheduled.store(false, Ordering::Release);
                let _ = logger.flush().await;
            });
        }
    }

    /// Send every queued entry. Failed batches are dropped, not retried.
    pub async fn flush(&self) -> Result<(), RestError> {
        let entries = std::mem::take(&mut *self.inner.queue.lock());
        if entries.is_empty() {
            return Ok(());
        }

        let count = entries.len();
        match self
            .inner
            .rest
            .post::<_, serde_json::Value>(LOG_PATH, &entries)
            .await
        {
            Ok(_) => {
                debug!(count, "Flushed remote log entries");
                Ok(())
            }
            Err(e) => {
                // tracing only; pushing here would feed the failure back into the queue
                warn!(count, error = %e, "Sending remote log entries failed");
                Err(e)
            }
        }
    }

    /// Flush whatever is left before the page goes away
    pub async fn page_unload(&self) {
        let _ = self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> RemoteLogger {
        let rest = RestClient::new(reqwest::Client::new(), "http://127.0.0.1:9", None);
        let location = Arc::new(Location::parse("https://portal.example/web/home").unwrap());
        RemoteLogger::new(rest, location, &ClientConfig::default())
    }

    #[test]
    fn test_entries_queue_without_runtime() {
        let logger = logger();
        logger.error("boom", None);
        logger.scoped("Demo App").warn("careful");
        assert_eq!(logger.pending(), 2);

        let queue = logger.inner.queue.lock();
        assert_eq!(queue[0].level, LogLevel::Error);
        assert_eq!(queue[0].path, "/web/home");
        assert!(queue[0].portal_app_name.is_none());
        assert_eq!(queue[1].portal_app_name.as_deref(), Some("Demo App"));
    }

    #[test]
    fn test_error_includes_cause() {
        let logger = logger();
        let cause = std::io::Error::other("disk full");
        logger.error("save failed", Some(&cause));
        assert_eq!(logger.inner.queue.lock()[0].message, "save failed: disk full");
    }

    #[test]
    fn test_entry_serialization() {
        let entry = LogEntry {
            level: LogLevel::Warn,
            portal_app_name: None,
            path: "/".into(),
            message: "m".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["level"], "warn");
        assert!(json.get("portalAppName").is_none());
    }
}
