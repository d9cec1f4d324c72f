//! In-process queue backend

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::jobs::run_at_after;
use shared::{Job, JobState, QueueCounts, RepeatableJob};

use super::{lock_deadline, millis, new_lock_token, QueueBackend, MAX_MOVES_PER_PASS};
use crate::error::WorkerResult;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// (priority, enqueued ms, sequence) -> id
    wait: BTreeMap<(u8, i64, u64), String>,
    /// (run ms, sequence) -> id
    delayed: BTreeMap<(i64, u64), String>,
    /// id -> (lock deadline ms, lock token)
    active: HashMap<String, (i64, String)>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    paused: bool,
    repeat: HashMap<String, RepeatableJob>,
}

impl QueueState {
    fn push_waiting(&mut self, job: &Job, enqueued_ms: i64, seq: u64) {
        self.wait
            .insert((job.priority().value(), enqueued_ms, seq), job.id.clone());
    }

    /// Release the claim on `job` if its token still holds it
    fn release(&mut self, job: &Job) -> bool {
        let owned = match (self.active.get(&job.id), job.lock_token.as_deref()) {
            (Some((_, held)), Some(token)) => held == token,
            _ => false,
        };
        if owned {
            self.active.remove(&job.id);
        }
        owned
    }

    fn push_delayed(&mut self, job: &Job, seq: u64) {
        self.delayed.insert((millis(job.run_at), seq), job.id.clone());
    }

    /// Push onto a finished list, dropping the oldest entries beyond `keep`
    fn push_finished(&mut self, failed: bool, id: &str, keep: Option<usize>) {
        let list = if failed {
            &mut self.failed
        } else {
            &mut self.completed
        };
        list.push_front(id.to_string());

        let mut dropped = Vec::new();
        if let Some(keep) = keep {
            while list.len() > keep {
                if let Some(old) = list.pop_back() {
                    dropped.push(old);
                }
            }
        }
        for old in dropped {
            self.jobs.remove(&old);
        }
    }
}

/// Queue backend holding everything in memory
///
/// Same semantics as the Redis backend, scoped to one process.
#[derive(Default)]
pub struct InMemoryQueueBackend {
    queues: Mutex<HashMap<String, QueueState>>,
    seq: AtomicU64,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.to_string()).or_default();
        f(state)
    }

    /// Finish an active job: `failed_reason` set means failure
    fn finish(&self, job: &Job, outcome: Result<Value, &str>) -> bool {
        self.with_queue(&job.queue, |state| {
            if !state.release(job) {
                return false;
            }

            let mut stored = job.clone();
            stored.lock_token = None;
            stored.finished_on = Some(Utc::now());
            let (failed, keep) = match outcome {
                Ok(value) => {
                    stored.state = JobState::Completed;
                    stored.return_value = Some(value);
                    (false, stored.opts.remove_on_complete)
                }
                Err(reason) => {
                    stored.state = JobState::Failed;
                    stored.failed_reason = Some(reason.to_string());
                    (true, stored.opts.remove_on_fail)
                }
            };

            let id = stored.id.clone();
            state.jobs.insert(id.clone(), stored);
            state.push_finished(failed, &id, keep);
            true
        })
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn add(&self, job: &Job) -> WorkerResult<bool> {
        let seq = self.next_seq();
        Ok(self.with_queue(&job.queue, |state| {
            if state.jobs.contains_key(&job.id) {
                return false;
            }

            if job.state == JobState::Delayed {
                state.push_delayed(job, seq);
            } else {
                state.push_waiting(job, millis(job.created_at), seq);
            }
            state.jobs.insert(job.id.clone(), job.clone());
            true
        }))
    }

    async fn fetch_next(&self, queue: &str, lock: Duration) -> WorkerResult<Option<Job>> {
        let now = Utc::now();
        Ok(self.with_queue(queue, |state| {
            if state.paused {
                return None;
            }

            while let Some((_, id)) = state.wait.pop_first() {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.state = JobState::Active;
                    job.processed_on = Some(now);
                    let token = new_lock_token();
                    state
                        .active
                        .insert(id, (lock_deadline(now, lock), token.clone()));

                    let mut claimed = job.clone();
                    claimed.lock_token = Some(token);
                    return Some(claimed);
                }
            }
            None
        }))
    }

    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &str,
        token: &str,
        lock: Duration,
    ) -> WorkerResult<bool> {
        Ok(self.with_queue(queue, |state| match state.active.get_mut(job_id) {
            Some((deadline, held)) if held == token => {
                *deadline = lock_deadline(Utc::now(), lock);
                true
            }
            _ => false,
        }))
    }

    async fn complete(&self, job: &Job, value: Value) -> WorkerResult<bool> {
        Ok(self.finish(job, Ok(value)))
    }

    async fn fail(&self, job: &Job, reason: &str) -> WorkerResult<bool> {
        Ok(self.finish(job, Err(reason)))
    }

    async fn retry(&self, job: &Job, delay: Duration, reason: &str) -> WorkerResult<bool> {
        let now = Utc::now();
        let seq = self.next_seq();
        Ok(self.with_queue(&job.queue, |state| {
            if !state.release(job) {
                return false;
            }

            let mut stored = job.clone();
            stored.lock_token = None;
            stored.failed_reason = Some(reason.to_string());
            if delay.is_zero() {
                stored.state = JobState::Waiting;
                stored.run_at = now;
                state.push_waiting(&stored, millis(now), seq);
            } else {
                stored.state = JobState::Delayed;
                stored.run_at = run_at_after(now, delay);
                state.push_delayed(&stored, seq);
            }
            state.jobs.insert(stored.id.clone(), stored);
            true
        }))
    }

    async fn promote_delayed(&self, queue: &str, now: DateTime<Utc>) -> WorkerResult<u64> {
        let now_ms = millis(now);
        let seq = self.next_seq();
        Ok(self.with_queue(queue, |state| {
            let due: Vec<(i64, u64)> = state
                .delayed
                .range(..=(now_ms, u64::MAX))
                .take(MAX_MOVES_PER_PASS)
                .map(|(key, _)| *key)
                .collect();

            let mut promoted = 0;
            for key in due {
                let Some(id) = state.delayed.remove(&key) else {
                    continue;
                };
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                job.state = JobState::Waiting;
                let job = job.clone();
                state.push_waiting(&job, now_ms, seq + promoted);
                promoted += 1;
            }
            promoted
        }))
    }

    async fn recover_stalled(&self, queue: &str, now: DateTime<Utc>) -> WorkerResult<Vec<String>> {
        let now_ms = millis(now);
        let seq = self.next_seq();
        Ok(self.with_queue(queue, |state| {
            let expired: Vec<String> = state
                .active
                .iter()
                .filter(|(_, (deadline, _))| *deadline <= now_ms)
                .map(|(id, _)| id.clone())
                .take(MAX_MOVES_PER_PASS)
                .collect();

            for (i, id) in expired.iter().enumerate() {
                state.active.remove(id);
                if let Some(job) = state.jobs.get_mut(id) {
                    job.state = JobState::Waiting;
                    let job = job.clone();
                    state.push_waiting(&job, now_ms, seq + i as u64);
                }
            }
            expired
        }))
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> WorkerResult<Option<Job>> {
        Ok(self.with_queue(queue, |state| state.jobs.get(job_id).cloned()))
    }

    async fn counts(&self, queue: &str) -> WorkerResult<QueueCounts> {
        Ok(self.with_queue(queue, |state| QueueCounts {
            waiting: state.wait.len() as u64,
            delayed: state.delayed.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            paused: state.paused,
        }))
    }

    async fn failed_jobs(&self, queue: &str, limit: usize) -> WorkerResult<Vec<Job>> {
        Ok(self.with_queue(queue, |state| {
            state
                .failed
                .iter()
                .take(limit)
                .filter_map(|id| state.jobs.get(id).cloned())
                .collect()
        }))
    }

    async fn retry_failed(&self, queue: &str, job_id: &str) -> WorkerResult<bool> {
        let now = Utc::now();
        let seq = self.next_seq();
        Ok(self.with_queue(queue, |state| {
            let Some(pos) = state.failed.iter().position(|id| id == job_id) else {
                return false;
            };
            state.failed.remove(pos);

            let Some(job) = state.jobs.get_mut(job_id) else {
                return false;
            };
            job.state = JobState::Waiting;
            job.attempts_made = 0;
            job.failed_reason = None;
            job.finished_on = None;
            job.run_at = now;
            let job = job.clone();
            state.push_waiting(&job, millis(now), seq);
            true
        }))
    }

    async fn drain(&self, queue: &str) -> WorkerResult<u64> {
        Ok(self.with_queue(queue, |state| {
            let ids: Vec<String> = state
                .wait
                .values()
                .chain(state.delayed.values())
                .cloned()
                .collect();
            for id in &ids {
                state.jobs.remove(id);
            }
            state.wait.clear();
            state.delayed.clear();
            ids.len() as u64
        }))
    }

    async fn pause(&self, queue: &str) -> WorkerResult<()> {
        self.with_queue(queue, |state| state.paused = true);
        Ok(())
    }

    async fn resume(&self, queue: &str) -> WorkerResult<()> {
        self.with_queue(queue, |state| state.paused = false);
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> WorkerResult<bool> {
        Ok(self.with_queue(queue, |state| state.paused))
    }

    async fn upsert_repeatable(&self, repeatable: &RepeatableJob) -> WorkerResult<()> {
        self.with_queue(&repeatable.queue, |state| {
            state
                .repeat
                .insert(repeatable.key.clone(), repeatable.clone());
        });
        Ok(())
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> WorkerResult<bool> {
        Ok(self.with_queue(queue, |state| state.repeat.remove(key).is_some()))
    }

    async fn repeatables(&self, queue: &str) -> WorkerResult<Vec<RepeatableJob>> {
        Ok(self.with_queue(queue, |state| {
            let mut all: Vec<RepeatableJob> = state.repeat.values().cloned().collect();
            all.sort_by_key(|r| r.next_run_ms);
            all
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use shared::{JobOptions, JobPriority};

    const LOCK: Duration = Duration::from_secs(30);

    fn job(name: &str, opts: JobOptions) -> Job {
        Job::new("email", name, json!({"name": name}), opts)
    }

    #[tokio::test]
    async fn test_add_is_idempotent_on_id() {
        let backend = InMemoryQueueBackend::new();
        let first = job("a", JobOptions::default().with_job_id("fixed"));
        let second = job("b", JobOptions::default().with_job_id("fixed"));

        assert!(backend.add(&first).await.unwrap());
        assert!(!backend.add(&second).await.unwrap());

        let stored = backend.get_job("email", "fixed").await.unwrap().unwrap();
        assert_eq!(stored.name, "a");
        assert_eq!(backend.counts("email").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_fetch_orders_by_priority_then_fifo() {
        let backend = InMemoryQueueBackend::new();
        let low = job("low", JobOptions::default().with_priority(JobPriority::Low));
        let normal_1 = job("normal-1", JobOptions::default());
        let normal_2 = job("normal-2", JobOptions::default());
        let critical = job("critical", JobOptions::default().with_priority(JobPriority::Critical));

        for j in [&low, &normal_1, &normal_2, &critical] {
            backend.add(j).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(j) = backend.fetch_next("email", LOCK).await.unwrap() {
            order.push(j.name);
        }
        assert_eq!(order, vec!["critical", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_paused_queue_yields_nothing() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();
        backend.pause("email").await.unwrap();

        assert!(backend.fetch_next("email", LOCK).await.unwrap().is_none());
        assert!(backend.counts("email").await.unwrap().paused);

        backend.resume("email").await.unwrap();
        assert!(backend.fetch_next("email", LOCK).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delayed_job_is_promoted_when_due() {
        let backend = InMemoryQueueBackend::new();
        let delayed = job("later", JobOptions::default().with_delay(Duration::from_secs(60)));
        backend.add(&delayed).await.unwrap();

        assert!(backend.fetch_next("email", LOCK).await.unwrap().is_none());
        assert_eq!(backend.promote_delayed("email", Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + ChronoDuration::seconds(61);
        assert_eq!(backend.promote_delayed("email", later).await.unwrap(), 1);

        let fetched = backend.fetch_next("email", LOCK).await.unwrap().unwrap();
        assert_eq!(fetched.id, delayed.id);
        assert_eq!(fetched.state, JobState::Active);
    }

    #[tokio::test]
    async fn test_complete_trims_finished_jobs() {
        let backend = InMemoryQueueBackend::new();
        let opts = JobOptions {
            remove_on_complete: Some(1),
            ..JobOptions::default()
        };

        let mut ids = Vec::new();
        for name in ["a", "b"] {
            backend.add(&job(name, opts.clone())).await.unwrap();
            let active = backend.fetch_next("email", LOCK).await.unwrap().unwrap();
            assert!(backend.complete(&active, json!({"ok": true})).await.unwrap());
            ids.push(active.id);
        }

        let counts = backend.counts("email").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert!(backend.get_job("email", &ids[0]).await.unwrap().is_none());

        let kept = backend.get_job("email", &ids[1]).await.unwrap().unwrap();
        assert_eq!(kept.state, JobState::Completed);
        assert_eq!(kept.return_value, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_complete_after_lock_lost_is_rejected() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();
        let active = backend
            .fetch_next("email", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        let later = Utc::now() + ChronoDuration::seconds(1);
        let stalled = backend.recover_stalled("email", later).await.unwrap();
        assert_eq!(stalled, vec![active.id.clone()]);

        assert!(!backend.complete(&active, Value::Null).await.unwrap());
        assert_eq!(backend.counts("email").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_extend_lock_prevents_stall_recovery() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();
        let active = backend
            .fetch_next("email", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        let token = active.lock_token.clone().unwrap();
        assert!(backend.extend_lock("email", &active.id, &token, LOCK).await.unwrap());
        let soon = Utc::now() + ChronoDuration::seconds(1);
        assert!(backend.recover_stalled("email", soon).await.unwrap().is_empty());
        assert!(!backend.extend_lock("email", "missing", &token, LOCK).await.unwrap());
        assert!(!backend.extend_lock("email", &active.id, "other", LOCK).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_claim_cannot_touch_reclaimed_job() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();

        let first = backend
            .fetch_next("email", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let later = Utc::now() + ChronoDuration::seconds(5);
        assert_eq!(backend.recover_stalled("email", later).await.unwrap(), vec![first.id.clone()]);
        let second = backend.fetch_next("email", LOCK).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_ne!(second.lock_token, first.lock_token);

        let first_token = first.lock_token.clone().unwrap();
        assert!(!backend.extend_lock("email", &first.id, &first_token, LOCK).await.unwrap());
        assert!(!backend.complete(&first, json!("stale")).await.unwrap());
        assert!(!backend.fail(&first, "stale").await.unwrap());
        assert!(!backend.retry(&first, Duration::ZERO, "stale").await.unwrap());

        assert!(backend.complete(&second, json!("fresh")).await.unwrap());
        let stored = backend.get_job("email", &first.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.return_value, Some(json!("fresh")));
        assert!(stored.lock_token.is_none());
    }

    #[tokio::test]
    async fn test_unclaimed_job_cannot_be_finished() {
        let backend = InMemoryQueueBackend::new();
        let queued = job("a", JobOptions::default());
        backend.add(&queued).await.unwrap();
        let active = backend.fetch_next("email", LOCK).await.unwrap().unwrap();

        let mut forged = active.clone();
        forged.lock_token = None;
        assert!(!backend.complete(&forged, Value::Null).await.unwrap());
        assert!(backend.complete(&active, Value::Null).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_with_huge_delay_is_capped() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();
        let active = backend.fetch_next("email", LOCK).await.unwrap().unwrap();

        assert!(backend.retry(&active, Duration::MAX, "HTTP 503").await.unwrap());

        let stored = backend.get_job("email", &active.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert!(stored.run_at <= Utc::now() + ChronoDuration::days(366));
    }

    #[tokio::test]
    async fn test_retry_with_delay_goes_to_delayed() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();
        let mut active = backend.fetch_next("email", LOCK).await.unwrap().unwrap();
        active.attempts_made = 1;

        assert!(backend
            .retry(&active, Duration::from_secs(5), "HTTP 503")
            .await
            .unwrap());

        let stored = backend.get_job("email", &active.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert_eq!(stored.attempts_made, 1);
        assert_eq!(stored.failed_reason.as_deref(), Some("HTTP 503"));

        let counts = backend.counts("email").await.unwrap();
        assert_eq!((counts.active, counts.delayed), (0, 1));
    }

    #[tokio::test]
    async fn test_retry_failed_resets_attempts() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();
        let mut active = backend.fetch_next("email", LOCK).await.unwrap().unwrap();
        active.attempts_made = 3;
        backend.fail(&active, "gave up").await.unwrap();

        let failed = backend.failed_jobs("email", 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_reason.as_deref(), Some("gave up"));

        assert!(backend.retry_failed("email", &active.id).await.unwrap());
        assert!(!backend.retry_failed("email", &active.id).await.unwrap());

        let requeued = backend.fetch_next("email", LOCK).await.unwrap().unwrap();
        assert_eq!(requeued.attempts_made, 0);
        assert!(requeued.failed_reason.is_none());
    }

    #[tokio::test]
    async fn test_drain_removes_waiting_and_delayed() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();
        backend
            .add(&job("b", JobOptions::default().with_delay(Duration::from_secs(60))))
            .await
            .unwrap();
        backend.add(&job("c", JobOptions::default())).await.unwrap();
        let active = backend.fetch_next("email", LOCK).await.unwrap().unwrap();

        assert_eq!(backend.drain("email").await.unwrap(), 2);

        let counts = backend.counts("email").await.unwrap();
        assert_eq!(counts.pending(), 1);
        assert!(backend.get_job("email", &active.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let backend = InMemoryQueueBackend::new();
        backend.add(&job("a", JobOptions::default())).await.unwrap();

        assert!(backend.fetch_next("payout", LOCK).await.unwrap().is_none());
        assert_eq!(backend.counts("payout").await.unwrap(), QueueCounts::default());
    }
}
