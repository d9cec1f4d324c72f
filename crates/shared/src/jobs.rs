//! Job and queue definitions shared by producers and workers
//!
//! Any service can build a [`Job`] and hand it to the queue manager; workers
//! read the same structure back from Redis.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Queue for instructor payouts
pub const PAYOUT_QUEUE: &str = "payout";

/// Queue for syncing payout status with the payment provider
pub const PAYOUT_SYNC_QUEUE: &str = "payout-sync";

/// Queue for transactional email
pub const EMAIL_QUEUE: &str = "email";

/// Longest delay a job may wait before it becomes runnable
pub const MAX_JOB_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `at + delay` with the delay capped at [`MAX_JOB_DELAY`]
pub fn run_at_after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(delay.min(MAX_JOB_DELAY))
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Priority tiers, dequeued lowest value first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    pub fn value(&self) -> u8 {
        match self {
            JobPriority::Critical => 1,
            JobPriority::High => 2,
            JobPriority::Normal => 3,
            JobPriority::Low => 4,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for JobPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(JobPriority::Critical),
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            _ => anyhow::bail!("Invalid job priority: {}", s),
        }
    }
}

/// Score of a waiting job: priority tier first, then enqueue time (FIFO)
///
/// Millisecond timestamps stay below 1e13 until the year 2286, so the tier
/// always dominates and the result is exact in an f64.
pub fn wait_score(priority: JobPriority, enqueued_at_ms: i64) -> f64 {
    priority.value() as f64 * 1e13 + enqueued_at_ms as f64
}

/// How retry delays grow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry back-off policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    pub delay_ms: u64,
    /// Fraction (0..=1) of the delay that may be randomly shaved off
    #[serde(default)]
    pub jitter: f64,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: delay.as_millis() as u64,
            jitter: 0.0,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: delay.as_millis() as u64,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, given how many attempts were made (1-indexed)
    ///
    /// Fixed: `delay`. Exponential: `delay * 2^(attempts_made - 1)`.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                base.saturating_mul(2u32.saturating_pow(exponent))
            }
        }
    }

    /// [`Self::delay_for_attempt`] with jitter applied
    pub fn jittered_delay(&self, attempts_made: u32) -> Duration {
        let delay = self.delay_for_attempt(attempts_made);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let max_cut = delay.as_millis() as f64 * self.jitter;
        let cut = rand::thread_rng().gen_range(0.0..=max_cut);
        delay.saturating_sub(Duration::from_millis(cut as u64))
    }
}

/// Per-job options; unset fields fall back to the queue defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts including the first run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<JobPriority>,
    /// Delay before the job becomes runnable, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Custom id; adding a job whose id already exists is a no-op
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Keep at most this many completed jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<usize>,
    /// Keep at most this many failed jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<usize>,
    /// Processing timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl JobOptions {
    /// Field-wise merge: values set here win over `defaults`
    pub fn merged_over(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            attempts: self.attempts.or(defaults.attempts),
            backoff: self.backoff.or(defaults.backoff),
            priority: self.priority.or(defaults.priority),
            delay_ms: self.delay_ms.or(defaults.delay_ms),
            job_id: self.job_id.clone().or_else(|| defaults.job_id.clone()),
            remove_on_complete: self.remove_on_complete.or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.or(defaults.remove_on_fail),
            timeout_ms: self.timeout_ms.or(defaults.timeout_ms),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }

    pub fn priority(&self) -> JobPriority {
        self.priority.unwrap_or_default()
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.unwrap_or(0))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Reject options a queue cannot honor
    pub fn validate(&self) -> crate::Result<()> {
        if self.delay() > MAX_JOB_DELAY {
            return Err(crate::Error::validation(format!(
                "delay_ms {} exceeds the maximum of {} ms",
                self.delay_ms.unwrap_or(0),
                MAX_JOB_DELAY.as_millis()
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(crate::Error::validation("timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A unit of background work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// Job name within the queue (e.g. `send-welcome-email`)
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    /// Key of the repeatable definition that produced this job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_key: Option<String>,
    /// Token of the current claim, set by the backend on fetch
    #[serde(skip)]
    pub lock_token: Option<String>,
}

impl Job {
    /// Create a job with already-merged options
    pub fn new(queue: &str, name: &str, data: serde_json::Value, opts: JobOptions) -> Self {
        let now = Utc::now();
        let delay = opts.delay();
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let run_at = run_at_after(now, delay);
        let state = if delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };

        Self {
            id,
            queue: queue.to_string(),
            name: name.to_string(),
            data,
            opts,
            state,
            attempts_made: 0,
            created_at: now,
            run_at,
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            return_value: None,
            repeat_key: None,
            lock_token: None,
        }
    }

    pub fn priority(&self) -> JobPriority {
        self.opts.priority()
    }

    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.run_at > now
    }

    /// Whether another attempt is allowed after the attempts made so far
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.opts.attempts()
    }

    /// Back-off delay before the next attempt (zero without a policy)
    pub fn retry_delay(&self) -> Duration {
        self.opts
            .backoff
            .map(|b| b.jittered_delay(self.attempts_made).min(MAX_JOB_DELAY))
            .unwrap_or(Duration::ZERO)
    }
}

/// Job counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

impl QueueCounts {
    /// Jobs not yet finished
    pub fn pending(&self) -> u64 {
        self.waiting + self.delayed + self.active
    }
}

/// Recurrence rule: a cron pattern or a fixed interval
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron expression (5 fields, or 6 with leading seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Fixed interval in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub every_ms: Option<u64>,
    /// Stop after this many runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl RepeatOptions {
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    pub fn every(interval: Duration) -> Self {
        Self {
            every_ms: Some(interval.as_millis() as u64),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Stable key identifying a repeatable definition
    pub fn key(&self, name: &str) -> String {
        match (&self.pattern, self.every_ms) {
            (Some(pattern), _) => format!("{}:cron:{}", name, pattern),
            (None, Some(every)) => format!("{}:every:{}", name, every),
            (None, None) => format!("{}:once", name),
        }
    }
}

/// A stored recurring job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatableJob {
    pub key: String,
    pub queue: String,
    pub name: String,
    pub data: serde_json::Value,
    pub repeat: RepeatOptions,
    pub opts: JobOptions,
    /// Next run as a UNIX timestamp in milliseconds
    pub next_run_ms: i64,
    /// Runs materialized so far
    pub count: u32,
    pub created_at: DateTime<Utc>,
}

impl RepeatableJob {
    pub fn limit_reached(&self) -> bool {
        self.repeat
            .limit
            .map(|limit| self.count >= limit)
            .unwrap_or(false)
    }

    /// Deterministic id for the run scheduled at `run_ms`
    pub fn run_job_id(&self, run_ms: i64) -> String {
        format!("repeat:{}:{}", self.key, run_ms)
    }
}

/// Static definition of a named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Jobs processed in parallel by one worker
    pub concurrency: usize,
    /// Priority tier applied to jobs that don't set one
    pub priority: JobPriority,
    pub default_job_options: JobOptions,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            priority: JobPriority::Normal,
            default_job_options: JobOptions::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_default_options(mut self, opts: JobOptions) -> Self {
        self.default_job_options = opts;
        self
    }

    /// Queue defaults with the queue's priority tier filled in
    pub fn effective_defaults(&self) -> JobOptions {
        let mut defaults = self.default_job_options.clone();
        defaults.priority = defaults.priority.or(Some(self.priority));
        defaults
    }
}

/// The LMS queues and their retry policies
pub fn default_queue_configs() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new(PAYOUT_QUEUE)
            .with_concurrency(2)
            .with_priority(JobPriority::High)
            .with_default_options(JobOptions {
                attempts: Some(3),
                backoff: Some(Backoff::exponential(Duration::from_secs(5))),
                remove_on_complete: Some(100),
                remove_on_fail: Some(500),
                ..JobOptions::default()
            }),
        QueueConfig::new(PAYOUT_SYNC_QUEUE)
            .with_concurrency(1)
            .with_priority(JobPriority::Normal)
            .with_default_options(JobOptions {
                attempts: Some(5),
                backoff: Some(Backoff::exponential(Duration::from_secs(10))),
                remove_on_complete: Some(50),
                remove_on_fail: Some(200),
                ..JobOptions::default()
            }),
        QueueConfig::new(EMAIL_QUEUE)
            .with_concurrency(5)
            .with_priority(JobPriority::Normal)
            .with_default_options(JobOptions {
                attempts: Some(3),
                backoff: Some(Backoff::exponential(Duration::from_secs(2))),
                remove_on_complete: Some(200),
                remove_on_fail: Some(500),
                ..JobOptions::default()
            }),
    ]
}
