//! Periodic Redis usage monitor
//!
//! Every interval the monitor collects a reading from its [`UsageSource`],
//! turns it into a [`UsageSnapshot`], updates alerts and metrics, and keeps
//! the snapshot as the latest one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{CacheService, CacheStats, MonitorConfig};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::alerts::{Alert, AlertLevel, AlertManager, AlertTransition, Observation};
use crate::error::MonitorResult;
use crate::metrics;
use crate::snapshot::UsageSnapshot;
use crate::source::UsageSource;
use crate::thresholds::{Metric, UsageThresholds};

/// Minimum cache lookups before the hit rate is worth a recommendation
const MIN_CACHE_LOOKUPS: u64 = 100;

/// Cache hit rate below which a recommendation is made
const LOW_CACHE_HIT_RATE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub generated_at: DateTime<Utc>,
    pub snapshot: Option<UsageSnapshot>,
    pub active_alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

#[derive(Default)]
struct MonitorState {
    latest: Option<UsageSnapshot>,
    alerts: AlertManager,
}

pub struct UsageMonitor {
    source: Arc<dyn UsageSource>,
    thresholds: UsageThresholds,
    limits: MonitorConfig,
    cache: Option<Arc<CacheService>>,
    state: RwLock<MonitorState>,
}

impl UsageMonitor {
    pub fn new(source: Arc<dyn UsageSource>, thresholds: UsageThresholds, limits: MonitorConfig) -> Self {
        Self {
            source,
            thresholds,
            limits,
            cache: None,
            state: RwLock::new(MonitorState::default()),
        }
    }

    /// Include this cache's counters in reports and metrics
    pub fn with_cache(mut self, cache: Arc<CacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn thresholds(&self) -> &UsageThresholds {
        &self.thresholds
    }

    /// Take one reading and update alerts
    ///
    /// When the source cannot be read, a critical `connection:primary` alert
    /// is raised and the error returned.
    pub async fn check_once(&self) -> MonitorResult<UsageSnapshot> {
        let raw = match self.source.collect().await {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "Failed to collect Redis usage");
                let mut state = self.state.write().await;
                let transition = state.alerts.observe(
                    Observation {
                        key: "connection:primary".to_string(),
                        level: Some(AlertLevel::Critical),
                        value: 0.0,
                        threshold: 1.0,
                        message: format!("Redis usage could not be collected: {}", e),
                    },
                    Utc::now(),
                );
                if let Some(AlertTransition::Raised(alert)) = &transition {
                    metrics::record_alert_raised(&alert.key, alert.level);
                }
                metrics::set_active_alerts(state.alerts.active().len());
                return Err(e);
            }
        };

        let mut state = self.state.write().await;
        let snapshot = UsageSnapshot::from_raw(raw, state.latest.as_ref(), &self.limits, Utc::now())?;

        for transition in state.alerts.evaluate(&snapshot, &self.thresholds) {
            match &transition {
                AlertTransition::Raised(alert) => {
                    metrics::record_alert_raised(&alert.key, alert.level)
                }
                AlertTransition::LevelChanged { from, alert } if alert.level > *from => {
                    metrics::record_alert_raised(&alert.key, alert.level)
                }
                _ => {}
            }
        }

        metrics::record_snapshot(&snapshot);
        metrics::set_active_alerts(state.alerts.active().len());
        if let Some(cache) = &self.cache {
            metrics::record_cache_stats(&cache.stats());
        }

        debug!(
            memory_percent = snapshot.memory_percent,
            key_count = snapshot.key_count,
            connected_clients = snapshot.connected_clients,
            ops_per_minute = snapshot.ops_per_minute,
            "Redis usage checked"
        );

        state.latest = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Check every interval until cancelled, the first check immediately
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        let every = self.limits.interval();
        info!(interval_secs = every.as_secs(), "Redis usage monitor started");

        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Redis usage monitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    // Errors are logged and alerted in check_once
                    let _ = self.check_once().await;
                }
            }
        }
    }

    pub async fn latest(&self) -> Option<UsageSnapshot> {
        self.state.read().await.latest.clone()
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.state.read().await.alerts.active()
    }

    pub async fn alert_history(&self) -> Vec<Alert> {
        self.state.read().await.alerts.history()
    }

    pub async fn usage_report(&self) -> UsageReport {
        let state = self.state.read().await;
        let cache = self.cache.as_ref().map(|c| c.stats());

        let recommendations = match &state.latest {
            Some(snapshot) => recommendations(snapshot, &self.thresholds, cache.as_ref()),
            None => vec!["No usage data collected yet".to_string()],
        };

        UsageReport {
            generated_at: Utc::now(),
            snapshot: state.latest.clone(),
            active_alerts: state.alerts.active(),
            recommendations,
            cache,
        }
    }
}

/// Operator advice for a snapshot; empty when everything is within limits
pub fn recommendations(
    snapshot: &UsageSnapshot,
    thresholds: &UsageThresholds,
    cache: Option<&CacheStats>,
) -> Vec<String> {
    let mut advice = Vec::new();

    for metric in Metric::ALL {
        let value = metric.value(snapshot);
        let Some(level) = thresholds.get(metric).level(value) else {
            continue;
        };

        let text = match metric {
            Metric::MemoryPercent => format!(
                "Memory at {:.1}% ({}): shorten cache TTLs, trim completed job history or raise maxmemory",
                value, level
            ),
            Metric::KeyCount => format!(
                "{} keys ({}): make sure every cached key carries a TTL and purge unused namespaces",
                snapshot.key_count, level
            ),
            Metric::Connections => format!(
                "{} client connections ({}): reuse pooled connections instead of opening new ones",
                snapshot.connected_clients, level
            ),
            Metric::OpsPerMinute => format!(
                "{:.0} ops/min ({}): batch reads with multi-get and pipeline writes",
                value, level
            ),
        };
        advice.push(text);
    }

    for health in snapshot.unhealthy_connections() {
        advice.push(format!(
            "Redis {} connection is unhealthy: check its URL and network reachability",
            health.role
        ));
    }

    if let Some(stats) = cache {
        let lookups = stats.hits + stats.misses;
        if lookups >= MIN_CACHE_LOOKUPS && stats.hit_rate() < LOW_CACHE_HIT_RATE {
            advice.push(format!(
                "Cache hit rate is {:.0}%: review TTLs and which reads are cached",
                stats.hit_rate() * 100.0
            ));
        }
    }

    advice
}
