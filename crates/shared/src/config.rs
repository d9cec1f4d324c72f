//! Configuration management using environment variables
//!
//! All settings have development defaults so a bare `cargo run` against a local
//! Redis works. A `.env` file is honoured when present.

use crate::error::{Error, Result};
use crate::jobs::{EMAIL_QUEUE, PAYOUT_QUEUE, PAYOUT_SYNC_QUEUE};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Redis connection configuration
    pub redis: RedisConfig,

    /// Cache service configuration
    pub cache: CacheConfig,

    /// Job queue runtime settings
    pub queues: QueueSettings,

    /// Usage monitor configuration
    pub monitor: MonitorConfig,

    /// Metrics exporter configuration
    pub metrics: MetricsConfig,

    /// Webhook delivery for the job workers
    pub webhooks: WebhookSettings,
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis host
    pub host: String,

    /// Redis port
    pub port: u16,

    /// Redis password (optional)
    pub password: Option<String>,

    /// Direct Redis URL (takes precedence over host/port/password)
    /// Supports both `redis://` and `rediss://` (TLS) schemes
    pub url: Option<String>,

    /// Dedicated URL for the cache connection (defaults to the primary URL)
    pub cache_url: Option<String>,

    /// Dedicated URL for the sessions connection (defaults to the primary URL)
    pub sessions_url: Option<String>,

    /// Dedicated URL for the jobs connection (defaults to the primary URL)
    pub jobs_url: Option<String>,

    /// Timeout for establishing a connection, in milliseconds
    pub connect_timeout_ms: u64,

    /// Timeout for a health-check PING, in milliseconds
    pub health_timeout_ms: u64,

    /// Prefix applied to every cache key
    pub key_prefix: String,
}

impl RedisConfig {
    /// Build a Redis connection URL
    ///
    /// If `url` is set (from REDIS_URL env var), uses that directly.
    /// Otherwise, builds URL from host/port/password components.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        if let Some(password) = &self.password {
            format!("redis://:{}@{}:{}", password, self.host, self.port)
        } else {
            format!("redis://{}:{}", self.host, self.port)
        }
    }

    /// Connection timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Health-check timeout as a Duration
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            url: None,
            cache_url: None,
            sessions_url: None,
            jobs_url: None,
            connect_timeout_ms: 5_000,
            health_timeout_ms: 3_000,
            key_prefix: "lms".to_string(),
        }
    }
}

/// Cache service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// When false, reads always miss and writes are dropped
    pub enabled: bool,

    /// TTL applied when a call does not specify one, in seconds
    pub default_ttl_secs: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 3600,
        }
    }
}

/// Runtime settings shared by every job queue
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Prefix for all queue keys
    pub prefix: String,

    /// How long an idle worker sleeps before polling again, in milliseconds
    pub poll_interval_ms: u64,

    /// How long a fetched job stays locked before it counts as stalled
    pub lock_duration_secs: u64,

    /// Scheduler tick (delayed promotion, stalled recovery, repeatables)
    pub scheduler_tick_ms: u64,

    /// How long shutdown waits for in-flight jobs
    pub shutdown_timeout_secs: u64,
}

impl QueueSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: "bull".to_string(),
            poll_interval_ms: 1_000,
            lock_duration_secs: 30,
            scheduler_tick_ms: 1_000,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Minimum interval between usage polls (10 seconds)
const MIN_MONITOR_INTERVAL_SECS: u64 = 10;

/// Usage monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Interval between usage polls in seconds
    pub interval_secs: u64,

    /// Memory budget used when the server reports `maxmemory 0`
    pub memory_limit_mb: u64,

    /// Connection budget used when the server does not report `maxclients`
    pub max_connections: u64,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_MONITOR_INTERVAL_SECS))
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            memory_limit_mb: 30,
            max_connections: 30,
        }
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// `host:port` for the Prometheus listener; exporter disabled when unset
    pub listen_addr: Option<String>,
}

/// Webhook delivery settings for the job workers
///
/// A queue without a URL is not consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    /// Bearer token sent with every delivery
    pub auth_token: Option<String>,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    pub payout_url: Option<String>,

    pub payout_sync_url: Option<String>,

    pub email_url: Option<String>,

    /// Cron pattern of the recurring payout sync; not registered when unset
    pub payout_sync_cron: Option<String>,
}

impl WebhookSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Webhook URL configured for `queue`
    pub fn url_for(&self, queue: &str) -> Option<&str> {
        match queue {
            PAYOUT_QUEUE => self.payout_url.as_deref(),
            PAYOUT_SYNC_QUEUE => self.payout_sync_url.as_deref(),
            EMAIL_QUEUE => self.email_url.as_deref(),
            _ => None,
        }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            auth_token: None,
            timeout_secs: 30,
            payout_url: None,
            payout_sync_url: None,
            email_url: None,
            payout_sync_cron: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Ok(Self {
            redis: RedisConfig {
                host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("REDIS_PORT")
                    .unwrap_or_else(|_| "6379".to_string())
                    .parse()
                    .map_err(|e| Error::config(format!("Invalid REDIS_PORT: {}", e)))?,
                password: env::var("REDIS_PASSWORD").ok(),
                // REDIS_URL takes precedence - supports TLS (rediss://)
                url: env::var("REDIS_URL").ok(),
                cache_url: env::var("REDIS_CACHE_URL").ok(),
                sessions_url: env::var("REDIS_SESSIONS_URL").ok(),
                jobs_url: env::var("REDIS_JOBS_URL").ok(),
                connect_timeout_ms: parse_env("REDIS_CONNECT_TIMEOUT_MS", 5_000)?,
                health_timeout_ms: parse_env("REDIS_HEALTH_TIMEOUT_MS", 3_000)?,
                key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| "lms".to_string()),
            },
            cache: CacheConfig {
                enabled: parse_env("CACHE_ENABLED", true)?,
                default_ttl_secs: parse_env("CACHE_DEFAULT_TTL_SECS", 3600)?,
            },
            queues: QueueSettings {
                prefix: env::var("QUEUE_PREFIX").unwrap_or_else(|_| "bull".to_string()),
                poll_interval_ms: parse_env("QUEUE_POLL_INTERVAL_MS", 1_000)?,
                lock_duration_secs: parse_env("QUEUE_LOCK_DURATION_SECS", 30)?,
                scheduler_tick_ms: parse_env("SCHEDULER_TICK_MS", 1_000)?,
                shutdown_timeout_secs: parse_env("WORKER_SHUTDOWN_TIMEOUT_SECS", 30)?,
            },
            monitor: MonitorConfig {
                interval_secs: parse_env("REDIS_MONITOR_INTERVAL_SECS", 120)?,
                memory_limit_mb: parse_env("REDIS_MEMORY_LIMIT_MB", 30)?,
                max_connections: parse_env("REDIS_MAX_CONNECTIONS", 30)?,
            },
            metrics: MetricsConfig {
                listen_addr: non_empty_env("METRICS_ADDR"),
            },
            webhooks: WebhookSettings {
                auth_token: non_empty_env("WEBHOOK_AUTH_TOKEN"),
                timeout_secs: parse_env("WEBHOOK_TIMEOUT_SECS", 30)?,
                payout_url: non_empty_env("PAYOUT_WEBHOOK_URL"),
                payout_sync_url: non_empty_env("PAYOUT_SYNC_WEBHOOK_URL"),
                email_url: non_empty_env("EMAIL_WEBHOOK_URL"),
                payout_sync_cron: non_empty_env("PAYOUT_SYNC_CRON"),
            },
        })
    }
}

/// Value of an environment variable, treating an empty value as unset
fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional environment variable, falling back to `default` when unset
pub fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}
