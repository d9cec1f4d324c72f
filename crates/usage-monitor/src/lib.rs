//! Redis usage monitoring for the LMS
//!
//! Polls Redis memory, key count, connections and command rate, compares them
//! with warning and critical thresholds, and keeps in-process alerts that
//! resolve on their own once the reading drops back.

pub mod alerts;
pub mod error;
pub mod info;
pub mod metrics;
pub mod monitor;
pub mod snapshot;
pub mod source;
pub mod thresholds;

pub use alerts::{Alert, AlertLevel, AlertManager, AlertTransition};
pub use error::{MonitorError, MonitorResult};
pub use info::{parse_info, RedisInfo};
pub use monitor::{UsageMonitor, UsageReport};
pub use snapshot::{RawUsage, UsageSnapshot};
pub use source::{RedisUsageSource, UsageSource};
pub use thresholds::{Metric, Threshold, UsageThresholds};
