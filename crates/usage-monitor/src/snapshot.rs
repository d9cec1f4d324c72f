//! Point-in-time Redis usage figures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{ConnectionHealth, MonitorConfig};

use crate::error::{MonitorError, MonitorResult};
use crate::info::RedisInfo;

/// Raw readings collected from Redis by a [`crate::source::UsageSource`]
#[derive(Debug, Clone, Default)]
pub struct RawUsage {
    pub info: RedisInfo,
    pub key_count: u64,
    pub connection_health: Vec<ConnectionHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub used_memory: u64,
    /// `maxmemory` when the server sets one, the configured budget otherwise
    pub max_memory: u64,
    pub memory_percent: f64,
    pub key_count: u64,
    pub connected_clients: u64,
    pub max_clients: u64,
    pub total_commands: u64,
    pub ops_per_minute: f64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub connection_health: Vec<ConnectionHealth>,
}

impl UsageSnapshot {
    /// Build a snapshot from raw readings
    ///
    /// `previous` is the last snapshot taken; operations per minute are the
    /// command count delta since then. Without a usable previous snapshot
    /// (first poll, server restart) the server's instantaneous rate is used.
    pub fn from_raw(
        raw: RawUsage,
        previous: Option<&UsageSnapshot>,
        limits: &MonitorConfig,
        now: DateTime<Utc>,
    ) -> MonitorResult<Self> {
        let info = &raw.info;

        let used_memory = info
            .get_u64("used_memory")
            .ok_or_else(|| MonitorError::invalid_info("used_memory missing"))?;
        let max_memory = match info.get_u64("maxmemory") {
            Some(max) if max > 0 => max,
            _ => limits.memory_limit_bytes(),
        };
        let memory_percent = if max_memory == 0 {
            0.0
        } else {
            used_memory as f64 / max_memory as f64 * 100.0
        };

        let max_clients = match info.get_u64("maxclients") {
            Some(max) if max > 0 => max,
            _ => limits.max_connections,
        };

        let total_commands = info.get_u64("total_commands_processed").unwrap_or(0);
        let instantaneous = info.get_f64("instantaneous_ops_per_sec").unwrap_or(0.0) * 60.0;

        let ops_per_minute = match previous {
            Some(prev) if total_commands >= prev.total_commands && now > prev.timestamp => {
                let minutes = (now - prev.timestamp).num_milliseconds() as f64 / 60_000.0;
                (total_commands - prev.total_commands) as f64 / minutes
            }
            _ => instantaneous,
        };

        Ok(Self {
            timestamp: now,
            used_memory,
            max_memory,
            memory_percent,
            key_count: raw.key_count,
            connected_clients: info.get_u64("connected_clients").unwrap_or(0),
            max_clients,
            total_commands,
            ops_per_minute,
            keyspace_hits: info.get_u64("keyspace_hits").unwrap_or(0),
            keyspace_misses: info.get_u64("keyspace_misses").unwrap_or(0),
            connection_health: raw.connection_health,
        })
    }

    /// Server-side keyspace hit rate, `None` before any lookup
    pub fn keyspace_hit_rate(&self) -> Option<f64> {
        let lookups = self.keyspace_hits + self.keyspace_misses;
        (lookups > 0).then(|| self.keyspace_hits as f64 / lookups as f64)
    }

    pub fn unhealthy_connections(&self) -> impl Iterator<Item = &ConnectionHealth> {
        self.connection_health.iter().filter(|h| !h.healthy)
    }
}
