//! Queue storage
//!
//! [`QueueBackend`] is the seam between the queue manager/workers and the
//! place jobs live. [`RedisQueueBackend`] is the production store;
//! [`InMemoryQueueBackend`] has the same semantics inside one process and is
//! used by tests and local tooling.
//!
//! Job lifecycle:
//!
//! ```text
//! add ──► delayed ──promote──► waiting ──fetch──► active ──complete──► completed
//!            ▲                    ▲                 │  │
//!            └──── retry (delay) ─┴── retry / stall ┘  └──fail──► failed
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{Job, QueueCounts, RepeatableJob};
use uuid::Uuid;

use crate::error::WorkerResult;

mod memory;
mod redis_store;

pub use memory::InMemoryQueueBackend;
pub use redis_store::RedisQueueBackend;

/// Upper bound of jobs moved per promote/stall pass
pub const MAX_MOVES_PER_PASS: usize = 1000;

/// Storage operations needed by the queue manager, workers and scheduler
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a job
    ///
    /// Returns `false` (and stores nothing) when a job with the same id
    /// already exists in the queue.
    async fn add(&self, job: &Job) -> WorkerResult<bool>;

    /// Claim the next waiting job, marking it active until `lock` elapses
    ///
    /// The returned job carries a fresh `lock_token`. Every later call that
    /// acts on the claim must present it. Returns `None` when nothing is
    /// waiting or the queue is paused.
    async fn fetch_next(&self, queue: &str, lock: Duration) -> WorkerResult<Option<Job>>;

    /// Push the lock deadline of an active job forward
    ///
    /// Returns `false` when the job is no longer active under `token`.
    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &str,
        token: &str,
        lock: Duration,
    ) -> WorkerResult<bool>;

    /// Mark an active job completed
    ///
    /// Returns `false` when `job.lock_token` no longer holds the claim (its
    /// lock expired, it was recovered as stalled and possibly re-claimed).
    async fn complete(&self, job: &Job, value: Value) -> WorkerResult<bool>;

    /// Mark an active job failed for good
    async fn fail(&self, job: &Job, reason: &str) -> WorkerResult<bool>;

    /// Move an active job back to delayed (or waiting when `delay` is zero)
    async fn retry(&self, job: &Job, delay: Duration, reason: &str) -> WorkerResult<bool>;

    /// Move delayed jobs whose run time has come to waiting
    async fn promote_delayed(&self, queue: &str, now: DateTime<Utc>) -> WorkerResult<u64>;

    /// Return active jobs whose lock expired to waiting, yielding their ids
    async fn recover_stalled(&self, queue: &str, now: DateTime<Utc>) -> WorkerResult<Vec<String>>;

    async fn get_job(&self, queue: &str, job_id: &str) -> WorkerResult<Option<Job>>;

    async fn counts(&self, queue: &str) -> WorkerResult<QueueCounts>;

    /// Most recently failed jobs, newest first
    async fn failed_jobs(&self, queue: &str, limit: usize) -> WorkerResult<Vec<Job>>;

    /// Move a failed job back to waiting with a fresh attempt budget
    ///
    /// Returns `false` when the job is not in the failed list.
    async fn retry_failed(&self, queue: &str, job_id: &str) -> WorkerResult<bool>;

    /// Remove every waiting and delayed job, returning how many were removed
    async fn drain(&self, queue: &str) -> WorkerResult<u64>;

    async fn pause(&self, queue: &str) -> WorkerResult<()>;

    async fn resume(&self, queue: &str) -> WorkerResult<()>;

    async fn is_paused(&self, queue: &str) -> WorkerResult<bool>;

    /// Insert or replace a recurring job definition
    async fn upsert_repeatable(&self, repeatable: &RepeatableJob) -> WorkerResult<()>;

    async fn remove_repeatable(&self, queue: &str, key: &str) -> WorkerResult<bool>;

    async fn repeatables(&self, queue: &str) -> WorkerResult<Vec<RepeatableJob>>;
}

/// Milliseconds since the UNIX epoch
pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Deadline of a lock taken at `now`
pub(crate) fn lock_deadline(now: DateTime<Utc>, lock: Duration) -> i64 {
    millis(now).saturating_add(i64::try_from(lock.as_millis()).unwrap_or(i64::MAX))
}

/// Token identifying one claim of a job
pub(crate) fn new_lock_token() -> String {
    Uuid::new_v4().to_string()
}
