//! Warning and critical levels for each monitored metric

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::alerts::AlertLevel;
use crate::error::{MonitorError, MonitorResult};
use crate::snapshot::UsageSnapshot;

/// Metrics compared against thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    MemoryPercent,
    KeyCount,
    Connections,
    OpsPerMinute,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::MemoryPercent,
        Metric::KeyCount,
        Metric::Connections,
        Metric::OpsPerMinute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::MemoryPercent => "memory_percent",
            Metric::KeyCount => "key_count",
            Metric::Connections => "connections",
            Metric::OpsPerMinute => "ops_per_minute",
        }
    }

    /// Current value of this metric in a snapshot
    pub fn value(&self, snapshot: &UsageSnapshot) -> f64 {
        match self {
            Metric::MemoryPercent => snapshot.memory_percent,
            Metric::KeyCount => snapshot.key_count as f64,
            Metric::Connections => snapshot.connected_clients as f64,
            Metric::OpsPerMinute => snapshot.ops_per_minute,
        }
    }

    fn env_prefix(&self) -> String {
        format!("REDIS_ALERT_{}", self.as_str().to_ascii_uppercase())
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    /// Level reached by `value`, `None` below warning
    pub fn level(&self, value: f64) -> Option<AlertLevel> {
        if value >= self.critical {
            Some(AlertLevel::Critical)
        } else if value >= self.warning {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }

    /// Threshold crossed for a given level
    pub fn limit(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Warning => self.warning,
            AlertLevel::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageThresholds {
    pub memory_percent: Threshold,
    pub key_count: Threshold,
    pub connections: Threshold,
    pub ops_per_minute: Threshold,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self {
            memory_percent: Threshold::new(70.0, 85.0),
            key_count: Threshold::new(8_000.0, 10_000.0),
            connections: Threshold::new(20.0, 25.0),
            ops_per_minute: Threshold::new(5_000.0, 10_000.0),
        }
    }
}

impl UsageThresholds {
    pub fn get(&self, metric: Metric) -> Threshold {
        match metric {
            Metric::MemoryPercent => self.memory_percent,
            Metric::KeyCount => self.key_count,
            Metric::Connections => self.connections,
            Metric::OpsPerMinute => self.ops_per_minute,
        }
    }

    fn get_mut(&mut self, metric: Metric) -> &mut Threshold {
        match metric {
            Metric::MemoryPercent => &mut self.memory_percent,
            Metric::KeyCount => &mut self.key_count,
            Metric::Connections => &mut self.connections,
            Metric::OpsPerMinute => &mut self.ops_per_minute,
        }
    }

    /// Defaults overridden by `REDIS_ALERT_<METRIC>_WARNING|CRITICAL`
    pub fn from_env() -> MonitorResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by values found through `lookup`
    pub fn from_lookup<F>(lookup: F) -> MonitorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut thresholds = Self::default();

        for metric in Metric::ALL {
            let prefix = metric.env_prefix();
            let threshold = thresholds.get_mut(metric);

            for (suffix, slot) in [
                ("WARNING", &mut threshold.warning),
                ("CRITICAL", &mut threshold.critical),
            ] {
                let name = format!("{}_{}", prefix, suffix);
                if let Some(raw) = lookup(&name) {
                    *slot = raw.trim().parse().map_err(|e| {
                        MonitorError::invalid_threshold(format!("{}={:?}: {}", name, raw, e))
                    })?;
                }
            }
        }

        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> MonitorResult<()> {
        for metric in Metric::ALL {
            let t = self.get(metric);
            if !(t.warning.is_finite() && t.critical.is_finite()) || t.warning < 0.0 {
                return Err(MonitorError::invalid_threshold(format!(
                    "{} thresholds must be non-negative numbers",
                    metric
                )));
            }
            if t.warning > t.critical {
                return Err(MonitorError::invalid_threshold(format!(
                    "{} warning ({}) is above critical ({})",
                    metric, t.warning, t.critical
                )));
            }
        }
        Ok(())
    }
}
