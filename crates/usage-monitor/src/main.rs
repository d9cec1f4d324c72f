//! Redis usage monitor for the LMS
//!
//! Polls the primary Redis server on a fixed interval and logs alerts when
//! memory, keys, connections or command rate cross their thresholds.

use std::sync::Arc;

use anyhow::{Context, Result};
use shared::{Config, RedisConnections};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use usage_monitor::{RedisUsageSource, UsageMonitor, UsageThresholds};

#[tokio::main]
async fn main() -> Result<()> {
    shared::init_tracing();

    tracing::info!("Starting Redis usage monitor...");

    let config = Config::from_env().context("Failed to load configuration")?;
    let thresholds = UsageThresholds::from_env().context("Failed to load alert thresholds")?;

    if let Some(addr) = &config.metrics.listen_addr {
        shared::init_metrics_exporter(addr).context("Failed to start metrics exporter")?;
        usage_monitor::metrics::describe_metrics();
    }

    let connections = Arc::new(RedisConnections::new(config.redis.clone()));
    connections
        .initialize()
        .await
        .context("Failed to connect to Redis")?;

    let source = Arc::new(RedisUsageSource::new(connections));
    let monitor = Arc::new(UsageMonitor::new(source, thresholds, config.monitor.clone()));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(monitor.clone().start(cancel.clone()));

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received, stopping usage monitor...");
    cancel.cancel();
    task.await.context("Monitor task panicked")?;

    let report = monitor.usage_report().await;
    tracing::info!(
        active_alerts = report.active_alerts.len(),
        report = %serde_json::to_string(&report).unwrap_or_default(),
        "Final usage report"
    );

    Ok(())
}
