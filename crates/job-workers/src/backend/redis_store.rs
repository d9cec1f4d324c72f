//! Redis queue backend
//!
//! Every queue lives under `{prefix}:{queue}:`. Multi-key transitions run as
//! Lua scripts so a crash between steps can never lose or duplicate a job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use serde_json::Value;
use shared::jobs::{run_at_after, wait_score};
use shared::{Job, JobState, QueueCounts, RepeatableJob};
use tracing::{debug, warn};

use super::{lock_deadline, millis, new_lock_token, QueueBackend, MAX_MOVES_PER_PASS};
use crate::error::WorkerResult;

/// Redis keys of one queue
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    /// Hash of job id -> JSON payload
    pub(crate) jobs: String,
    /// Zset of runnable job ids scored by priority tier and enqueue time
    pub(crate) wait: String,
    /// Zset of job ids scored by run time in ms
    pub(crate) delayed: String,
    /// Zset of claimed job ids scored by lock deadline in ms
    pub(crate) active: String,
    /// Hash of claimed job id -> lock token of the current claim
    pub(crate) locks: String,
    /// List of completed job ids, newest first
    pub(crate) completed: String,
    /// List of failed job ids, newest first
    pub(crate) failed: String,
    /// Present while the queue is paused
    pub(crate) paused: String,
    /// Hash of repeat key -> repeatable definition JSON
    pub(crate) repeat: String,
}

impl QueueKeys {
    pub(crate) fn new(prefix: &str, queue: &str) -> Self {
        let base = if prefix.is_empty() {
            queue.to_string()
        } else {
            format!("{prefix}:{queue}")
        };

        Self {
            jobs: format!("{base}:jobs"),
            wait: format!("{base}:wait"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            locks: format!("{base}:locks"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            paused: format!("{base}:paused"),
            repeat: format!("{base}:repeat"),
        }
    }
}

struct Scripts {
    add: Script,
    fetch: Script,
    extend_lock: Script,
    finish: Script,
    retry: Script,
    move_due: Script,
    drain: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            add: Script::new(include_str!("scripts/add.lua")),
            fetch: Script::new(include_str!("scripts/fetch.lua")),
            extend_lock: Script::new(include_str!("scripts/extend_lock.lua")),
            finish: Script::new(include_str!("scripts/finish.lua")),
            retry: Script::new(include_str!("scripts/retry.lua")),
            move_due: Script::new(include_str!("scripts/move_due.lua")),
            drain: Script::new(include_str!("scripts/drain.lua")),
        }
    }
}

/// Queue backend on Redis sorted sets, lists and hashes
pub struct RedisQueueBackend {
    redis: ConnectionManager,
    prefix: String,
    scripts: Scripts,
}

impl RedisQueueBackend {
    /// Create a backend storing queues under `prefix`
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            scripts: Scripts::load(),
        }
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    async fn finish(
        &self,
        job: &Job,
        failed: bool,
        keep: Option<usize>,
    ) -> WorkerResult<bool> {
        let Some(token) = job.lock_token.as_deref() else {
            return Ok(false);
        };
        let keys = self.keys(&job.queue);
        let target = if failed { &keys.failed } else { &keys.completed };
        let payload = serde_json::to_string(job)?;
        let keep = keep.map(|k| k as i64).unwrap_or(-1);

        let mut conn = self.redis.clone();
        let moved: i64 = self
            .scripts
            .finish
            .key(&keys.active)
            .key(&keys.jobs)
            .key(target)
            .key(&keys.locks)
            .arg(&job.id)
            .arg(payload)
            .arg(keep)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn move_due(
        &self,
        source: &str,
        keys: &QueueKeys,
        now: DateTime<Utc>,
    ) -> WorkerResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let moved: Vec<String> = self
            .scripts
            .move_due
            .key(source)
            .key(&keys.wait)
            .key(&keys.jobs)
            .key(&keys.locks)
            .arg(millis(now))
            .arg(MAX_MOVES_PER_PASS)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    /// State of a non-finished job from the zset holding it
    async fn live_state(&self, keys: &QueueKeys, job_id: &str) -> WorkerResult<JobState> {
        let mut conn = self.redis.clone();
        let (active, delayed): (Option<f64>, Option<f64>) = redis::pipe()
            .zscore(&keys.active, job_id)
            .zscore(&keys.delayed, job_id)
            .query_async(&mut conn)
            .await?;

        Ok(match (active, delayed) {
            (Some(_), _) => JobState::Active,
            (None, Some(_)) => JobState::Delayed,
            (None, None) => JobState::Waiting,
        })
    }

    fn decode(payload: &str) -> Option<Job> {
        match serde_json::from_str(payload) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable job payload");
                None
            }
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn add(&self, job: &Job) -> WorkerResult<bool> {
        let keys = self.keys(&job.queue);
        let payload = serde_json::to_string(job)?;
        let score = wait_score(job.priority(), millis(job.created_at)) as i64;
        let delayed = job.state == JobState::Delayed;

        let mut conn = self.redis.clone();
        let added: i64 = self
            .scripts
            .add
            .key(&keys.jobs)
            .key(&keys.wait)
            .key(&keys.delayed)
            .arg(&job.id)
            .arg(payload)
            .arg(score)
            .arg(millis(job.run_at))
            .arg(if delayed { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        Ok(added == 1)
    }

    async fn fetch_next(&self, queue: &str, lock: Duration) -> WorkerResult<Option<Job>> {
        let keys = self.keys(queue);
        let now = Utc::now();
        let token = new_lock_token();

        let mut conn = self.redis.clone();
        let payload: Option<String> = self
            .scripts
            .fetch
            .key(&keys.wait)
            .key(&keys.active)
            .key(&keys.paused)
            .key(&keys.jobs)
            .key(&keys.locks)
            .arg(lock_deadline(now, lock))
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let mut job: Job = serde_json::from_str(&payload)?;
        job.state = JobState::Active;
        job.processed_on = Some(now);

        // The job is locked, so nothing else writes its payload meanwhile
        let _: () = conn
            .hset(&keys.jobs, &job.id, serde_json::to_string(&job)?)
            .await?;
        job.lock_token = Some(token);

        debug!(queue = queue, job_id = %job.id, "Fetched job");
        Ok(Some(job))
    }

    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &str,
        token: &str,
        lock: Duration,
    ) -> WorkerResult<bool> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let extended: i64 = self
            .scripts
            .extend_lock
            .key(&keys.active)
            .key(&keys.locks)
            .arg(job_id)
            .arg(token)
            .arg(lock_deadline(Utc::now(), lock))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn complete(&self, job: &Job, value: Value) -> WorkerResult<bool> {
        let mut stored = job.clone();
        stored.state = JobState::Completed;
        stored.finished_on = Some(Utc::now());
        stored.return_value = Some(value);
        let keep = stored.opts.remove_on_complete;
        self.finish(&stored, false, keep).await
    }

    async fn fail(&self, job: &Job, reason: &str) -> WorkerResult<bool> {
        let mut stored = job.clone();
        stored.state = JobState::Failed;
        stored.finished_on = Some(Utc::now());
        stored.failed_reason = Some(reason.to_string());
        let keep = stored.opts.remove_on_fail;
        self.finish(&stored, true, keep).await
    }

    async fn retry(&self, job: &Job, delay: Duration, reason: &str) -> WorkerResult<bool> {
        let Some(token) = job.lock_token.as_deref() else {
            return Ok(false);
        };
        let keys = self.keys(&job.queue);
        let now = Utc::now();

        let mut stored = job.clone();
        stored.failed_reason = Some(reason.to_string());
        let (target, score) = if delay.is_zero() {
            stored.state = JobState::Waiting;
            stored.run_at = now;
            (&keys.wait, wait_score(stored.priority(), millis(now)) as i64)
        } else {
            stored.state = JobState::Delayed;
            stored.run_at = run_at_after(now, delay);
            (&keys.delayed, millis(stored.run_at))
        };

        let mut conn = self.redis.clone();
        let moved: i64 = self
            .scripts
            .retry
            .key(&keys.active)
            .key(&keys.jobs)
            .key(target)
            .key(&keys.locks)
            .arg(&stored.id)
            .arg(serde_json::to_string(&stored)?)
            .arg(score)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn promote_delayed(&self, queue: &str, now: DateTime<Utc>) -> WorkerResult<u64> {
        let keys = self.keys(queue);
        let moved = self.move_due(&keys.delayed, &keys, now).await?;
        Ok(moved.len() as u64)
    }

    async fn recover_stalled(&self, queue: &str, now: DateTime<Utc>) -> WorkerResult<Vec<String>> {
        let keys = self.keys(queue);
        self.move_due(&keys.active, &keys, now).await
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> WorkerResult<Option<Job>> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn.hget(&keys.jobs, job_id).await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let mut job: Job = serde_json::from_str(&payload)?;
        if !matches!(job.state, JobState::Completed | JobState::Failed) {
            job.state = self.live_state(&keys, job_id).await?;
        }
        Ok(Some(job))
    }

    async fn counts(&self, queue: &str) -> WorkerResult<QueueCounts> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let (waiting, delayed, active, completed, failed, paused): (u64, u64, u64, u64, u64, bool) =
            redis::pipe()
                .zcard(&keys.wait)
                .zcard(&keys.delayed)
                .zcard(&keys.active)
                .llen(&keys.completed)
                .llen(&keys.failed)
                .exists(&keys.paused)
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
            paused,
        })
    }

    async fn failed_jobs(&self, queue: &str, limit: usize) -> WorkerResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .lrange(&keys.failed, 0, limit as isize - 1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&keys.jobs)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        Ok(payloads
            .into_iter()
            .flatten()
            .filter_map(|payload| Self::decode(&payload))
            .collect())
    }

    async fn retry_failed(&self, queue: &str, job_id: &str) -> WorkerResult<bool> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let removed: i64 = conn.lrem(&keys.failed, 0, job_id).await?;
        if removed == 0 {
            return Ok(false);
        }

        let payload: Option<String> = conn.hget(&keys.jobs, job_id).await?;
        let Some(payload) = payload else {
            return Ok(false);
        };

        let now = Utc::now();
        let mut job: Job = serde_json::from_str(&payload)?;
        job.state = JobState::Waiting;
        job.attempts_made = 0;
        job.failed_reason = None;
        job.finished_on = None;
        job.run_at = now;

        let score = wait_score(job.priority(), millis(now)) as i64;
        let _: () = redis::pipe()
            .atomic()
            .hset(&keys.jobs, job_id, serde_json::to_string(&job)?)
            .ignore()
            .zadd(&keys.wait, job_id, score)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(true)
    }

    async fn drain(&self, queue: &str) -> WorkerResult<u64> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let removed: u64 = self
            .scripts
            .drain
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.jobs)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn pause(&self, queue: &str) -> WorkerResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let _: () = conn.set(&keys.paused, 1).await?;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> WorkerResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let _: () = conn.del(&keys.paused).await?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> WorkerResult<bool> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        Ok(conn.exists(&keys.paused).await?)
    }

    async fn upsert_repeatable(&self, repeatable: &RepeatableJob) -> WorkerResult<()> {
        let keys = self.keys(&repeatable.queue);
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(&keys.repeat, &repeatable.key, serde_json::to_string(repeatable)?)
            .await?;
        Ok(())
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> WorkerResult<bool> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let removed: i64 = conn.hdel(&keys.repeat, key).await?;
        Ok(removed > 0)
    }

    async fn repeatables(&self, queue: &str) -> WorkerResult<Vec<RepeatableJob>> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let payloads: Vec<String> = conn.hvals(&keys.repeat).await?;

        let mut all: Vec<RepeatableJob> = payloads
            .iter()
            .filter_map(|payload| match serde_json::from_str(payload) {
                Ok(repeatable) => Some(repeatable),
                Err(e) => {
                    warn!(queue = queue, error = %e, "Skipping undecodable repeatable job");
                    None
                }
            })
            .collect();
        all.sort_by_key(|r: &RepeatableJob| r.next_run_ms);
        Ok(all)
    }
}
