//! Job workers for the LMS
//!
//! Consumes the payout, payout-sync and email queues from Redis and delivers
//! each job to the webhook configured for its queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use job_workers::processors::ReqwestHttpClient;
use job_workers::{JobQueueManager, RedisQueueBackend, RetryPolicy, WebhookConfig, WebhookProcessor};
use serde_json::json;
use shared::{
    default_queue_configs, Config, JobOptions, RedisConnections, RedisRole, RepeatOptions,
    EMAIL_QUEUE, PAYOUT_QUEUE, PAYOUT_SYNC_QUEUE,
};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    shared::init_tracing();

    tracing::info!("Starting job workers...");

    let config = Config::from_env().context("Failed to load configuration")?;

    if let Some(addr) = &config.metrics.listen_addr {
        shared::init_metrics_exporter(addr).context("Failed to start metrics exporter")?;
        job_workers::metrics::describe_metrics();
    }

    let connections = RedisConnections::new(config.redis.clone());
    connections
        .initialize()
        .await
        .context("Failed to connect to Redis")?;

    let jobs_conn = connections
        .get(RedisRole::Jobs)
        .await
        .context("Failed to open jobs connection")?;

    let backend = Arc::new(RedisQueueBackend::new(jobs_conn, &config.queues.prefix));
    let manager = JobQueueManager::new(backend, config.queues.clone());

    for queue in default_queue_configs() {
        manager.create_queue(queue);
    }

    let client = Arc::new(ReqwestHttpClient::new().context("Failed to create HTTP client")?);
    let webhooks = &config.webhooks;

    let mut started = 0;
    for queue in [PAYOUT_QUEUE, PAYOUT_SYNC_QUEUE, EMAIL_QUEUE] {
        let Some(url) = webhooks.url_for(queue) else {
            tracing::warn!(queue = queue, "No webhook configured, queue will not be consumed");
            continue;
        };

        let mut webhook = WebhookConfig::new(url).with_timeout(webhooks.timeout());
        if let Some(token) = &webhooks.auth_token {
            webhook = webhook.with_auth_token(token.clone());
        }

        let processor = WebhookProcessor::new(client.clone(), webhook, RetryPolicy::default())
            .with_context(|| format!("Invalid webhook for queue {}", queue))?;

        manager.start_worker(queue, Arc::new(processor)).await?;
        started += 1;
    }

    if let Some(pattern) = &webhooks.payout_sync_cron {
        let repeatable = manager
            .schedule_recurring_job(
                PAYOUT_SYNC_QUEUE,
                "sync-pending-payouts",
                json!({}),
                RepeatOptions::cron(pattern.clone()),
                JobOptions::default(),
            )
            .await
            .context("Failed to schedule payout sync")?;
        tracing::info!(
            key = %repeatable.key,
            runs = repeatable.count,
            "Recurring payout sync registered"
        );
    }

    manager.start_scheduler().await;

    tracing::info!(workers = started, "Job workers ready");

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received, stopping job workers...");

    manager.shutdown().await;

    Ok(())
}
