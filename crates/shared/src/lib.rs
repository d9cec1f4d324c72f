//! Shared library for the LMS Redis services
//!
//! This crate provides common functionality used by the job workers and the
//! usage monitor:
//! - Configuration management
//! - Error handling types
//! - Logging and metrics infrastructure
//! - Named Redis connections with health checks
//! - Namespaced cache service
//! - Job and queue definitions

pub mod config;
pub mod error;
pub mod jobs;
pub mod redis;

// Re-export commonly used types
pub use config::{
    CacheConfig, Config, MetricsConfig, MonitorConfig, QueueSettings, RedisConfig, WebhookSettings,
};
pub use error::{Error, Result};
pub use jobs::{
    default_queue_configs, Backoff, BackoffKind, Job, JobOptions, JobPriority, JobState,
    QueueConfig, QueueCounts, RepeatOptions, RepeatableJob, EMAIL_QUEUE, PAYOUT_QUEUE,
    PAYOUT_SYNC_QUEUE,
};
pub use crate::redis::{
    CacheOptions, CacheService, CacheStats, ConnectionHealth, RedisConnections, RedisRole,
};

/// Initialize tracing subscriber for structured logging
///
/// `RUST_LOG` controls filtering; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "shared=debug,job_workers=debug,usage_monitor=debug,info".into()
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Install the Prometheus exporter, serving `/metrics` on `listen_addr`
///
/// Must be called from inside a Tokio runtime. Metrics recorded before this
/// call are dropped.
pub fn init_metrics_exporter(listen_addr: &str) -> Result<()> {
    let addr: std::net::SocketAddr = listen_addr
        .parse()
        .map_err(|e| Error::config(format!("Invalid METRICS_ADDR '{}': {}", listen_addr, e)))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus exporter: {}", e)))?;

    tracing::info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exporter_rejects_bad_address() {
        let result = init_metrics_exporter("not-an-address");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
