//! Process configuration loaded from environment variables.
//!
//! Every knob has a default, so an empty environment yields a working
//! single-node server backed by the in-memory store. Service knobs default
//! to the services' own `Default` impls.

use std::time::Duration;

use crate::services::document::DocumentConfig;
use crate::services::manager::ManagerConfig;
use crate::services::storage::RetryPolicy;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_IDLE_SWEEP_MS: u64 = 1000;

/// A client queue must hold the whole connect intro without being drained.
const MIN_CLIENT_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Postgres connection string. Without it documents live in memory only.
    pub database_url: Option<String>,
    /// Connections that have not authenticated by then are closed.
    pub auth_timeout: Duration,
    /// Outbound queue per websocket connection.
    pub client_queue_capacity: usize,
    pub manager: ManagerConfig,
    /// Period of the idle-document sweeper.
    pub idle_sweep: Duration,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let defaults = ManagerConfig::default();

        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url,
            auth_timeout: Duration::from_secs(env_parse("AUTH_TIMEOUT_SECS", DEFAULT_AUTH_TIMEOUT_SECS)),
            client_queue_capacity: env_parse("CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY)
                .max(MIN_CLIENT_QUEUE_CAPACITY),
            manager: ManagerConfig {
                document: DocumentConfig {
                    queue_capacity: env_parse("DOCUMENT_QUEUE_CAPACITY", defaults.document.queue_capacity),
                    broadcast_timeout: env_millis("BROADCAST_TIMEOUT_MS", defaults.document.broadcast_timeout),
                    presence_enabled: env_parse("PRESENCE_ENABLED", defaults.document.presence_enabled),
                },
                retry: RetryPolicy {
                    attempts: env_parse("STORAGE_RETRIES", defaults.retry.attempts),
                    base: env_millis("STORAGE_RETRY_BASE_MS", defaults.retry.base),
                    timeout: env_millis("STORAGE_TIMEOUT_MS", defaults.retry.timeout),
                },
                idle_after: Duration::from_secs(env_parse("DOCUMENT_IDLE_SECS", defaults.idle_after.as_secs())),
            },
            idle_sweep: Duration::from_millis(env_parse("IDLE_SWEEP_MS", DEFAULT_IDLE_SWEEP_MS)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            manager: ManagerConfig::default(),
            idle_sweep: Duration::from_millis(DEFAULT_IDLE_SWEEP_MS),
        }
    }
}

/// Parse `key` from the environment, falling back to `default` when the
/// variable is missing or malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Millisecond variant of [`env_parse`].
fn env_millis(key: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(env_parse(key, default_ms))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
