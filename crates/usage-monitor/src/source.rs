//! Where usage readings come from

use std::sync::Arc;

use async_trait::async_trait;
use shared::{RedisConnections, RedisRole};
use tracing::debug;

use crate::error::MonitorResult;
use crate::info::parse_info;
use crate::snapshot::RawUsage;

const INFO_SECTIONS: [&str; 4] = ["server", "clients", "memory", "stats"];

/// Source of raw usage readings
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn collect(&self) -> MonitorResult<RawUsage>;
}

/// Reads `INFO` and `DBSIZE` from the primary connection and pings every
/// opened role
pub struct RedisUsageSource {
    connections: Arc<RedisConnections>,
}

impl RedisUsageSource {
    pub fn new(connections: Arc<RedisConnections>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl UsageSource for RedisUsageSource {
    async fn collect(&self) -> MonitorResult<RawUsage> {
        let mut conn = self.connections.get(RedisRole::Primary).await?;

        let mut pipe = redis::pipe();
        for section in INFO_SECTIONS {
            pipe.cmd("INFO").arg(section);
        }
        pipe.cmd("DBSIZE");

        let (server, clients, memory, stats, key_count): (String, String, String, String, u64) =
            pipe.query_async(&mut conn).await?;

        let info = parse_info(&[server, clients, memory, stats].join("\r\n"));
        let connection_health = self.connections.health_check().await;

        debug!(
            key_count = key_count,
            roles = connection_health.len(),
            "Collected Redis usage"
        );

        Ok(RawUsage {
            info,
            key_count,
            connection_health,
        })
    }
}
