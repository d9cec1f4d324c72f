//! In-process alert state
//!
//! One active alert per key: a metric name, or `connection:<role>` for
//! connection health. A value at or above the warning threshold raises the
//! alert or moves it to the level reached; a value below warning resolves it
//! into a bounded history, newest first.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::snapshot::UsageSnapshot;
use crate::thresholds::{Metric, UsageThresholds};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Warning => f.write_str("warning"),
            AlertLevel::Critical => f.write_str("critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub key: String,
    pub level: AlertLevel,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// What an observation did to the alert of its key
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Raised(Alert),
    LevelChanged { from: AlertLevel, alert: Alert },
    Resolved(Alert),
}

/// One reading of a key, `level` is `None` when the key is fine
#[derive(Debug, Clone)]
pub struct Observation {
    pub key: String,
    pub level: Option<AlertLevel>,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

#[derive(Debug)]
pub struct AlertManager {
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    capacity: usize,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl AlertManager {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            history: VecDeque::new(),
            capacity: history_capacity,
        }
    }

    /// Active alerts, critical first then oldest first
    pub fn active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.values().cloned().collect();
        alerts.sort_by(|a, b| b.level.cmp(&a.level).then(a.raised_at.cmp(&b.raised_at)));
        alerts
    }

    pub fn get(&self, key: &str) -> Option<&Alert> {
        self.active.get(key)
    }

    /// Resolved alerts, newest first
    pub fn history(&self) -> Vec<Alert> {
        self.history.iter().cloned().collect()
    }

    /// Compare a snapshot with the thresholds and update alerts
    pub fn evaluate(
        &mut self,
        snapshot: &UsageSnapshot,
        thresholds: &UsageThresholds,
    ) -> Vec<AlertTransition> {
        let now = snapshot.timestamp;
        let mut transitions = Vec::new();

        for metric in Metric::ALL {
            let threshold = thresholds.get(metric);
            let value = metric.value(snapshot);
            let level = threshold.level(value);
            let limit = level.map(|l| threshold.limit(l)).unwrap_or(threshold.warning);

            let observation = Observation {
                key: metric.as_str().to_string(),
                level,
                value,
                threshold: limit,
                message: metric_message(metric, value, limit, level),
            };
            transitions.extend(self.observe(observation, now));
        }

        for health in &snapshot.connection_health {
            let observation = Observation {
                key: format!("connection:{}", health.role),
                level: (!health.healthy).then_some(AlertLevel::Critical),
                value: if health.healthy { 1.0 } else { 0.0 },
                threshold: 1.0,
                message: if health.healthy {
                    format!("Redis {} connection is healthy", health.role)
                } else {
                    format!(
                        "Redis {} connection is unhealthy: {}",
                        health.role,
                        health.error.as_deref().unwrap_or("no reply")
                    )
                },
            };
            transitions.extend(self.observe(observation, now));
        }

        transitions
    }

    /// Apply one observation
    pub fn observe(&mut self, obs: Observation, now: DateTime<Utc>) -> Option<AlertTransition> {
        let current = self.active.get(&obs.key).map(|a| a.level);

        match (obs.level, current) {
            (None, None) => None,
            (None, Some(_)) => {
                let mut alert = self.active.remove(&obs.key)?;
                alert.value = obs.value;
                alert.updated_at = now;
                alert.resolved_at = Some(now);

                info!(key = %alert.key, value = obs.value, "Alert resolved");

                self.history.push_front(alert.clone());
                self.history.truncate(self.capacity);
                Some(AlertTransition::Resolved(alert))
            }
            (Some(level), None) => {
                let alert = Alert {
                    id: uuid::Uuid::new_v4().to_string(),
                    key: obs.key.clone(),
                    level,
                    value: obs.value,
                    threshold: obs.threshold,
                    message: obs.message,
                    raised_at: now,
                    updated_at: now,
                    resolved_at: None,
                };

                log_raised(&alert);
                self.active.insert(obs.key, alert.clone());
                Some(AlertTransition::Raised(alert))
            }
            (Some(level), Some(from)) => {
                let alert = self.active.get_mut(&obs.key)?;
                alert.value = obs.value;
                alert.threshold = obs.threshold;
                alert.message = obs.message;
                alert.updated_at = now;

                if from == level {
                    return None;
                }

                alert.level = level;
                warn!(
                    key = %alert.key,
                    from = %from,
                    to = %level,
                    value = alert.value,
                    "Alert level changed"
                );
                Some(AlertTransition::LevelChanged {
                    from,
                    alert: alert.clone(),
                })
            }
        }
    }
}

fn log_raised(alert: &Alert) {
    match alert.level {
        AlertLevel::Critical => error!(
            key = %alert.key,
            value = alert.value,
            threshold = alert.threshold,
            "{}", alert.message
        ),
        AlertLevel::Warning => warn!(
            key = %alert.key,
            value = alert.value,
            threshold = alert.threshold,
            "{}", alert.message
        ),
    }
}

fn metric_message(metric: Metric, value: f64, limit: f64, level: Option<AlertLevel>) -> String {
    let reading = match metric {
        Metric::MemoryPercent => format!("Redis memory usage at {:.1}%", value),
        Metric::KeyCount => format!("Redis holds {:.0} keys", value),
        Metric::Connections => format!("Redis has {:.0} client connections", value),
        Metric::OpsPerMinute => format!("Redis is serving {:.0} ops/min", value),
    };

    match level {
        Some(level) => format!("{} ({} threshold {})", reading, level, limit),
        None => reading,
    }
}
