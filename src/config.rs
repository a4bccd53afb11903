use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::{info, warn};

use crate::error::HubError;
use crate::hub::HubSettings;
use crate::link::BackoffPolicy;
use crate::relay::KNOWN_CHANNELS;

// Listeners
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:8081";

// Collaborators
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";
pub const DEFAULT_RELAY_CHANNELS: &str = "market_status,scan_results";
pub const DEFAULT_DATA_DIR: &str = "./data";

// Loops
pub const DEFAULT_PRICE_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;
pub const STATS_INTERVAL_SECS: u64 = 60;

// Limits
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 1024;

// Reconnect
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_BACKOFF_JITTER_MS: u64 = 250;
pub const DEFAULT_BACKOFF_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BACKOFF_MIN_STABLE_MS: u64 = 5_000;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub api_bind_address: String,
    pub upstream_url: Option<String>,
    pub upstream_api_key: Option<String>,
    pub redis_url: Option<String>,
    pub relay_channels: Vec<String>,
    pub data_dir: String,
    pub price_interval: Duration,
    pub lookup_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_connections: usize,
    pub client_queue_capacity: usize,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            api_bind_address: DEFAULT_API_BIND_ADDRESS.to_string(),
            upstream_url: None,
            upstream_api_key: None,
            redis_url: Some(DEFAULT_REDIS_URL.to_string()),
            relay_channels: split_list(DEFAULT_RELAY_CHANNELS),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            price_interval: Duration::from_millis(DEFAULT_PRICE_INTERVAL_MS),
            lookup_timeout: Duration::from_millis(DEFAULT_LOOKUP_TIMEOUT_MS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
                ceiling: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
                factor: DEFAULT_BACKOFF_FACTOR,
                jitter_ms: DEFAULT_BACKOFF_JITTER_MS,
                max_attempts: DEFAULT_BACKOFF_MAX_ATTEMPTS,
                min_stable: Duration::from_millis(DEFAULT_BACKOFF_MIN_STABLE_MS),
            },
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            log_level: "info".to_string(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Non-empty value of `key`, if set.
fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parsed value of `key`; unparsable values fall back to `default` with a warning.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}='{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let redis_url = match env::var("REDIS_URL") {
            Ok(url) if url.trim().is_empty() => None,
            Ok(url) => Some(url),
            Err(_) => defaults.redis_url,
        };

        Self {
            bind_address: env_string("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            api_bind_address: env_string("API_BIND_ADDRESS").unwrap_or(defaults.api_bind_address),
            upstream_url: env_string("UPSTREAM_URL"),
            upstream_api_key: env_string("UPSTREAM_API_KEY"),
            redis_url,
            relay_channels: env_string("RELAY_CHANNELS")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.relay_channels),
            data_dir: env_string("DATA_DIR").unwrap_or(defaults.data_dir),
            price_interval: Duration::from_millis(env_parse("PRICE_INTERVAL_MS", DEFAULT_PRICE_INTERVAL_MS)),
            lookup_timeout: Duration::from_millis(env_parse("LOOKUP_TIMEOUT_MS", DEFAULT_LOOKUP_TIMEOUT_MS)),
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )),
            heartbeat_timeout: Duration::from_secs(env_parse(
                "HEARTBEAT_TIMEOUT_SECS",
                DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            )),
            max_connections: env_parse("MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            client_queue_capacity: env_parse("CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(env_parse("BACKOFF_INITIAL_MS", DEFAULT_BACKOFF_INITIAL_MS)),
                ceiling: Duration::from_millis(env_parse("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)),
                factor: env_parse("BACKOFF_FACTOR", DEFAULT_BACKOFF_FACTOR),
                jitter_ms: env_parse("BACKOFF_JITTER_MS", DEFAULT_BACKOFF_JITTER_MS),
                max_attempts: env_parse("BACKOFF_MAX_ATTEMPTS", DEFAULT_BACKOFF_MAX_ATTEMPTS),
                min_stable: Duration::from_millis(env_parse(
                    "BACKOFF_MIN_STABLE_MS",
                    DEFAULT_BACKOFF_MIN_STABLE_MS,
                )),
            },
            connect_timeout: Duration::from_secs(env_parse("CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)),
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE_SECS)),
            log_level: env_string("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    pub fn validate(&self) -> Result<(), HubError> {
        if self.heartbeat_interval.is_zero() {
            return Err(HubError::Config("heartbeat interval must be positive".to_string()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(HubError::Config(
                "heartbeat timeout must be longer than the heartbeat interval".to_string(),
            ));
        }
        if self.price_interval.is_zero() {
            return Err(HubError::Config("price interval must be positive".to_string()));
        }
        if self.lookup_timeout >= self.price_interval {
            return Err(HubError::Config(
                "lookup timeout must be shorter than the price interval".to_string(),
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(HubError::Config("backoff max attempts must be at least 1".to_string()));
        }
        if self.backoff.initial.is_zero() {
            return Err(HubError::Config("initial backoff delay must be positive".to_string()));
        }
        if self.backoff.ceiling < self.backoff.initial {
            return Err(HubError::Config(
                "backoff ceiling must not be below the initial delay".to_string(),
            ));
        }
        if !self.backoff.factor.is_finite() || self.backoff.factor < 1.0 {
            return Err(HubError::Config("backoff factor must be at least 1.0".to_string()));
        }
        if self.max_connections == 0 || self.client_queue_capacity == 0 {
            return Err(HubError::Config(
                "connection limit and queue capacity must be positive".to_string(),
            ));
        }
        if let Some(unknown) = self
            .relay_channels
            .iter()
            .find(|channel| !KNOWN_CHANNELS.contains(&channel.as_str()))
        {
            return Err(HubError::Config(format!(
                "unknown relay channel '{}' (known: {})",
                unknown,
                KNOWN_CHANNELS.join(", ")
            )));
        }

        Ok(())
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            max_connections: self.max_connections,
            queue_capacity: self.client_queue_capacity,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }

    pub fn log_config(&self) {
        info!("Server configuration:");
        info!("  WebSocket address: {}", self.bind_address);
        info!("  API address: {}", self.api_bind_address);
        info!(
            "  Upstream: {}",
            self.upstream_url.as_deref().unwrap_or("(none, store-only pricing)")
        );
        info!(
            "  Relay broker: {} {:?}",
            self.redis_url.as_deref().unwrap_or("(disabled)"),
            self.relay_channels
        );
        info!("  Data directory: {}", self.data_dir);
        info!(
            "  Price interval: {:?} (lookup timeout {:?})",
            self.price_interval, self.lookup_timeout
        );
        info!(
            "  Heartbeat: every {:?}, timeout {:?}",
            self.heartbeat_interval, self.heartbeat_timeout
        );
        info!(
            "  Limits: {} connections, {} queued frames each",
            self.max_connections, self.client_queue_capacity
        );
        info!(
            "  Backoff: {:?} x{} up to {:?}, jitter {}ms, {} attempts, reset after {:?} up",
            self.backoff.initial,
            self.backoff.factor,
            self.backoff.ceiling,
            self.backoff.jitter_ms,
            self.backoff.max_attempts,
            self.backoff.min_stable
        );
        info!("  Log level: {}", self.log_level);
    }
}
