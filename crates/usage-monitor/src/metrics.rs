//! Prometheus metrics for Redis usage

use metrics::{counter, describe_counter, describe_gauge, gauge};
use shared::CacheStats;

use crate::alerts::AlertLevel;
use crate::snapshot::UsageSnapshot;

pub fn describe_metrics() {
    describe_gauge!("redis_memory_used_bytes", "Memory used by Redis");
    describe_gauge!("redis_memory_usage_percent", "Memory used as a share of the budget");
    describe_gauge!("redis_keys", "Keys in the monitored database");
    describe_gauge!("redis_connected_clients", "Client connections");
    describe_gauge!("redis_ops_per_minute", "Commands processed per minute");
    describe_gauge!("redis_connection_healthy", "1 when the role answers PING");
    describe_gauge!("redis_active_alerts", "Usage alerts currently active");
    describe_counter!("redis_alerts_raised_total", "Usage alerts raised");
    describe_gauge!("cache_hits", "Cache lookups that hit");
    describe_gauge!("cache_misses", "Cache lookups that missed");
}

pub fn record_snapshot(snapshot: &UsageSnapshot) {
    gauge!("redis_memory_used_bytes").set(snapshot.used_memory as f64);
    gauge!("redis_memory_usage_percent").set(snapshot.memory_percent);
    gauge!("redis_keys").set(snapshot.key_count as f64);
    gauge!("redis_connected_clients").set(snapshot.connected_clients as f64);
    gauge!("redis_ops_per_minute").set(snapshot.ops_per_minute);

    for health in &snapshot.connection_health {
        gauge!("redis_connection_healthy", "role" => health.role.to_string())
            .set(if health.healthy { 1.0 } else { 0.0 });
    }
}

pub fn record_alert_raised(key: &str, level: AlertLevel) {
    counter!(
        "redis_alerts_raised_total",
        "key" => key.to_string(),
        "level" => level.to_string()
    )
    .increment(1);
}

pub fn set_active_alerts(count: usize) {
    gauge!("redis_active_alerts").set(count as f64);
}

pub fn record_cache_stats(stats: &CacheStats) {
    gauge!("cache_hits").set(stats.hits as f64);
    gauge!("cache_misses").set(stats.misses as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_snapshot(&UsageSnapshot {
            timestamp: Utc::now(),
            used_memory: 1,
            max_memory: 2,
            memory_percent: 50.0,
            key_count: 3,
            connected_clients: 4,
            max_clients: 30,
            total_commands: 5,
            ops_per_minute: 6.0,
            keyspace_hits: 0,
            keyspace_misses: 0,
            connection_health: vec![],
        });
        record_alert_raised("memory_percent", AlertLevel::Warning);
        set_active_alerts(1);
        record_cache_stats(&CacheStats::default());
    }
}
