//! Named Redis connections
//!
//! One connection manager per logical concern, opened on first use. Each
//! `ConnectionManager` is multiplexed and reconnects on its own; this module
//! adds bounded health checks and logs when a role drops or comes back.
//!
//! Only the primary connection is mandatory: [`RedisConnections::initialize`]
//! fails when it cannot be reached, while secondary roles are logged and
//! retried lazily on their next [`RedisConnections::get`].

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// Logical Redis connection roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedisRole {
    Primary,
    Cache,
    Sessions,
    Jobs,
}

impl RedisRole {
    pub const ALL: [RedisRole; 4] = [
        RedisRole::Primary,
        RedisRole::Cache,
        RedisRole::Sessions,
        RedisRole::Jobs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RedisRole::Primary => "primary",
            RedisRole::Cache => "cache",
            RedisRole::Sessions => "sessions",
            RedisRole::Jobs => "jobs",
        }
    }

    /// Resolve the URL for this role, falling back to the primary URL
    pub fn url(&self, config: &RedisConfig) -> String {
        let role_url = match self {
            RedisRole::Primary => None,
            RedisRole::Cache => config.cache_url.as_ref(),
            RedisRole::Sessions => config.sessions_url.as_ref(),
            RedisRole::Jobs => config.jobs_url.as_ref(),
        };

        role_url
            .cloned()
            .unwrap_or_else(|| config.connection_url())
    }
}

impl fmt::Display for RedisRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of pinging one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub role: RedisRole,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pool of named Redis connections
pub struct RedisConnections {
    config: RedisConfig,
    slots: HashMap<RedisRole, OnceCell<ConnectionManager>>,
    /// Last observed health per role, used to log transitions
    health: DashMap<RedisRole, bool>,
}

impl RedisConnections {
    /// Create an empty pool; no connection is opened until first use
    pub fn new(config: RedisConfig) -> Self {
        let slots = RedisRole::ALL
            .iter()
            .map(|role| (*role, OnceCell::new()))
            .collect();

        Self {
            config,
            slots,
            health: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Get (opening on first call) the connection for a role
    pub async fn get(&self, role: RedisRole) -> Result<ConnectionManager> {
        let slot = self
            .slots
            .get(&role)
            .ok_or_else(|| Error::internal(format!("No connection slot for role {}", role)))?;

        let conn = slot.get_or_try_init(|| self.open(role)).await?;
        Ok(conn.clone())
    }

    async fn open(&self, role: RedisRole) -> Result<ConnectionManager> {
        let url = role.url(&self.config);
        let client =
            Client::open(url).map_err(|e| Error::config(format!("Invalid Redis URL for {}: {}", role, e)))?;

        debug!(role = %role, "Opening Redis connection");

        let conn = tokio::time::timeout(self.config.connect_timeout(), ConnectionManager::new(client))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "connecting {} role after {}ms",
                    role, self.config.connect_timeout_ms
                ))
            })??;

        info!(role = %role, "Redis connection established");
        self.health.insert(role, true);

        Ok(conn)
    }

    /// Whether a role has been opened
    pub fn is_connected(&self, role: RedisRole) -> bool {
        self.slots
            .get(&role)
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }

    /// Roles whose connection has been opened
    pub fn connected_roles(&self) -> Vec<RedisRole> {
        RedisRole::ALL
            .iter()
            .copied()
            .filter(|role| self.is_connected(*role))
            .collect()
    }

    /// Open and ping every role
    ///
    /// # Errors
    ///
    /// Returns an error only when the primary connection cannot be opened or
    /// does not answer PING.
    pub async fn initialize(&self) -> Result<()> {
        self.get(RedisRole::Primary).await?;
        self.ping(RedisRole::Primary).await?;

        for role in RedisRole::ALL.iter().filter(|r| **r != RedisRole::Primary) {
            let result = match self.get(*role).await {
                Ok(_) => self.ping(*role).await.map(|_| ()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(
                    role = %role,
                    error = %e,
                    "Secondary Redis connection unavailable, will retry on next use"
                );
            }
        }

        info!(
            connected = ?self.connected_roles(),
            "Redis connections initialized"
        );

        Ok(())
    }

    /// PING a role, bounded by the health timeout
    ///
    /// Returns the round-trip latency.
    pub async fn ping(&self, role: RedisRole) -> Result<Duration> {
        let mut conn = self.get(role).await?;
        let started = Instant::now();

        let reply = tokio::time::timeout(
            self.config.health_timeout(),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await;

        let outcome = match reply {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(Error::Redis(e)),
            Err(_) => Err(Error::timeout(format!(
                "PING on {} role after {}ms",
                role, self.config.health_timeout_ms
            ))),
        };

        self.record_health(role, outcome.is_ok(), outcome.as_ref().err());
        outcome
    }

    /// Ping every opened role
    pub async fn health_check(&self) -> Vec<ConnectionHealth> {
        let mut report = Vec::new();

        for role in self.connected_roles() {
            let health = match self.ping(role).await {
                Ok(latency) => ConnectionHealth {
                    role,
                    healthy: true,
                    latency_ms: Some(latency.as_millis() as u64),
                    error: None,
                },
                Err(e) => ConnectionHealth {
                    role,
                    healthy: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                },
            };
            report.push(health);
        }

        report
    }

    fn record_health(&self, role: RedisRole, healthy: bool, error: Option<&Error>) {
        let previous = self.health.insert(role, healthy);

        match (previous, healthy) {
            (Some(true), false) | (None, false) => {
                warn!(
                    role = %role,
                    error = error.map(|e| e.to_string()).unwrap_or_default(),
                    "Redis connection lost"
                );
            }
            (Some(false), true) => {
                info!(role = %role, "Redis connection re-established");
            }
            _ => {}
        }
    }

    /// Last observed health for a role (None when never checked)
    pub fn last_health(&self, role: RedisRole) -> Option<bool> {
        self.health.get(&role).map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_url_falls_back_to_primary() {
        let config = RedisConfig {
            url: Some("redis://primary:6379".to_string()),
            cache_url: Some("redis://cache:6379".to_string()),
            ..RedisConfig::default()
        };

        assert_eq!(RedisRole::Primary.url(&config), "redis://primary:6379");
        assert_eq!(RedisRole::Cache.url(&config), "redis://cache:6379");
        assert_eq!(RedisRole::Sessions.url(&config), "redis://primary:6379");
        assert_eq!(RedisRole::Jobs.url(&config), "redis://primary:6379");
    }

    #[test]
    fn test_role_display() {
        assert_eq!(RedisRole::Primary.to_string(), "primary");
        assert_eq!(RedisRole::Jobs.to_string(), "jobs");
        assert_eq!(
            serde_json::to_string(&RedisRole::Sessions).unwrap(),
            "\"sessions\""
        );
    }

    #[test]
    fn test_new_pool_is_lazy() {
        let pool = RedisConnections::new(RedisConfig::default());
        assert!(pool.connected_roles().is_empty());
        assert!(!pool.is_connected(RedisRole::Primary));
        assert!(pool.last_health(RedisRole::Primary).is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let config = RedisConfig {
            url: Some("invalid://url".to_string()),
            ..RedisConfig::default()
        };
        let pool = RedisConnections::new(config);

        let result = pool.get(RedisRole::Primary).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(!pool.is_connected(RedisRole::Primary));
    }

    #[tokio::test]
    async fn test_initialize_fails_when_primary_invalid() {
        let config = RedisConfig {
            url: Some("invalid://url".to_string()),
            ..RedisConfig::default()
        };
        let pool = RedisConnections::new(config);

        assert!(pool.initialize().await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires REDIS_URL
    async fn test_failed_secondary_does_not_abort_initialize() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let pool = RedisConnections::new(RedisConfig {
            url: Some(redis_url),
            cache_url: Some("invalid://x".to_string()),
            ..RedisConfig::default()
        });

        pool.initialize().await.unwrap();

        let connected = pool.connected_roles();
        assert!(connected.contains(&RedisRole::Primary));
        assert!(connected.contains(&RedisRole::Jobs));
        assert!(!connected.contains(&RedisRole::Cache));

        // The slot stays empty, so each use retries and reports the same error
        for _ in 0..2 {
            let result = pool.get(RedisRole::Cache).await;
            assert!(matches!(result, Err(Error::Config(_))));
        }
        assert!(!pool.is_connected(RedisRole::Cache));
        assert!(pool.ping(RedisRole::Primary).await.is_ok());
    }

    #[test]
    fn test_health_transitions_are_tracked() {
        let pool = RedisConnections::new(RedisConfig::default());

        pool.record_health(RedisRole::Cache, true, None);
        assert_eq!(pool.last_health(RedisRole::Cache), Some(true));

        pool.record_health(RedisRole::Cache, false, Some(&Error::timeout("ping")));
        assert_eq!(pool.last_health(RedisRole::Cache), Some(false));

        pool.record_health(RedisRole::Cache, true, None);
        assert_eq!(pool.last_health(RedisRole::Cache), Some(true));
    }
}
