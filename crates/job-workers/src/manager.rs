//! Job queue manager
//!
//! Entry point for producers and for the worker binary: registers queues,
//! enqueues jobs (immediate, delayed, recurring), exposes queue statistics
//! and administration, and owns the worker and scheduler tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use shared::{Job, JobOptions, QueueConfig, QueueCounts, QueueSettings, RepeatOptions, RepeatableJob};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::QueueBackend;
use crate::error::{WorkerError, WorkerResult};
use crate::events::{EventBus, JobEvent};
use crate::processors::JobProcessor;
use crate::schedule::RepeatSchedule;
use crate::scheduler::Scheduler;
use crate::worker::{Worker, WorkerSettings};

pub struct JobQueueManager {
    backend: Arc<dyn QueueBackend>,
    settings: QueueSettings,
    queues: Arc<DashMap<String, QueueConfig>>,
    events: EventBus,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl JobQueueManager {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: QueueSettings) -> Self {
        Self {
            backend,
            settings,
            queues: Arc::new(DashMap::new()),
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    /// Register a queue; registering a name again replaces its config
    pub fn create_queue(&self, config: QueueConfig) {
        let name = config.name.clone();
        let concurrency = config.concurrency;
        let priority = config.priority;

        if self.queues.insert(name.clone(), config).is_some() {
            warn!(queue = %name, "Queue already registered, configuration replaced");
        } else {
            info!(
                queue = %name,
                concurrency = concurrency,
                priority = %priority,
                "Queue registered"
            );
        }
    }

    pub fn queue_config(&self, queue: &str) -> Option<QueueConfig> {
        self.queues.get(queue).map(|entry| entry.value().clone())
    }

    /// Names of registered queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    fn require_queue(&self, queue: &str) -> WorkerResult<QueueConfig> {
        self.queue_config(queue)
            .ok_or_else(|| WorkerError::queue_not_found(queue))
    }

    /// Enqueue a job with options merged over the queue defaults
    ///
    /// When a job with the same id exists, nothing is enqueued and the
    /// existing job is returned.
    pub async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> WorkerResult<Job> {
        let config = self.require_queue(queue)?;
        let merged = opts.merged_over(&config.effective_defaults());
        merged.validate()?;
        let job = Job::new(queue, name, data, merged);

        if !self.backend.add(&job).await? {
            info!(queue = queue, job_id = %job.id, "Job id already exists, not enqueued again");
            return self
                .backend
                .get_job(queue, &job.id)
                .await?
                .ok_or_else(|| WorkerError::JobNotFound(job.id.clone()));
        }

        info!(
            queue = queue,
            job_id = %job.id,
            name = name,
            priority = %job.priority(),
            delay_ms = job.opts.delay().as_millis() as u64,
            "Job added"
        );

        self.events.emit(JobEvent::Added {
            queue: queue.to_string(),
            job_id: job.id.clone(),
            name: name.to_string(),
            delayed: job.state == shared::JobState::Delayed,
        });

        Ok(job)
    }

    /// Enqueue a job to run at `run_at` (immediately when that is in the past)
    pub async fn schedule_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        run_at: DateTime<Utc>,
        opts: JobOptions,
    ) -> WorkerResult<Job> {
        let delay = (run_at - Utc::now()).to_std().unwrap_or_default();
        self.add_job(queue, name, data, opts.with_delay(delay)).await
    }

    /// Register (or replace) a recurring job
    pub async fn schedule_recurring_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        repeat: RepeatOptions,
        opts: JobOptions,
    ) -> WorkerResult<RepeatableJob> {
        let config = self.require_queue(queue)?;
        let schedule = RepeatSchedule::parse(&repeat)?;
        let opts = opts.merged_over(&config.effective_defaults());
        opts.validate()?;

        let now = Utc::now();
        let next_run = schedule.next_after(now).ok_or_else(|| {
            WorkerError::invalid_schedule(format!("schedule for '{}' has no upcoming run", name))
        })?;

        // Re-registering keeps the run count so a limit survives restarts
        let key = repeat.key(name);
        let existing = self
            .backend
            .repeatables(queue)
            .await?
            .into_iter()
            .find(|r| r.key == key);
        let (count, created_at) = existing
            .map(|r| (r.count, r.created_at))
            .unwrap_or((0, now));

        let repeatable = RepeatableJob {
            key,
            queue: queue.to_string(),
            name: name.to_string(),
            data,
            repeat,
            opts,
            next_run_ms: next_run.timestamp_millis(),
            count,
            created_at,
        };

        self.backend.upsert_repeatable(&repeatable).await?;

        info!(
            queue = queue,
            key = %repeatable.key,
            next_run = %next_run,
            "Recurring job scheduled"
        );

        Ok(repeatable)
    }

    pub async fn remove_recurring_job(&self, queue: &str, key: &str) -> WorkerResult<bool> {
        self.require_queue(queue)?;
        let removed = self.backend.remove_repeatable(queue, key).await?;
        if removed {
            info!(queue = queue, key = key, "Recurring job removed");
        }
        Ok(removed)
    }

    pub async fn recurring_jobs(&self, queue: &str) -> WorkerResult<Vec<RepeatableJob>> {
        self.require_queue(queue)?;
        self.backend.repeatables(queue).await
    }

    pub async fn get_job(&self, queue: &str, job_id: &str) -> WorkerResult<Option<Job>> {
        self.require_queue(queue)?;
        self.backend.get_job(queue, job_id).await
    }

    pub async fn queue_stats(&self, queue: &str) -> WorkerResult<QueueCounts> {
        self.require_queue(queue)?;
        self.backend.counts(queue).await
    }

    /// Counts of every registered queue, keyed by name
    pub async fn all_queue_stats(&self) -> WorkerResult<BTreeMap<String, QueueCounts>> {
        let mut stats = BTreeMap::new();
        for queue in self.queue_names() {
            let counts = self.backend.counts(&queue).await?;
            stats.insert(queue, counts);
        }
        Ok(stats)
    }

    pub async fn pause_queue(&self, queue: &str) -> WorkerResult<()> {
        self.require_queue(queue)?;
        self.backend.pause(queue).await?;
        info!(queue = queue, "Queue paused");
        Ok(())
    }

    pub async fn resume_queue(&self, queue: &str) -> WorkerResult<()> {
        self.require_queue(queue)?;
        self.backend.resume(queue).await?;
        info!(queue = queue, "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self, queue: &str) -> WorkerResult<bool> {
        self.require_queue(queue)?;
        self.backend.is_paused(queue).await
    }

    pub async fn failed_jobs(&self, queue: &str, limit: usize) -> WorkerResult<Vec<Job>> {
        self.require_queue(queue)?;
        self.backend.failed_jobs(queue, limit).await
    }

    /// Put a failed job back in the queue with a fresh attempt budget
    pub async fn retry_failed_job(&self, queue: &str, job_id: &str) -> WorkerResult<()> {
        self.require_queue(queue)?;
        if !self.backend.retry_failed(queue, job_id).await? {
            return Err(WorkerError::JobNotFound(format!("{} in failed jobs of {}", job_id, queue)));
        }
        info!(queue = queue, job_id = job_id, "Failed job requeued");
        Ok(())
    }

    /// Drop all waiting and delayed jobs of a queue
    pub async fn drain_queue(&self, queue: &str) -> WorkerResult<u64> {
        self.require_queue(queue)?;
        let removed = self.backend.drain(queue).await?;
        warn!(queue = queue, removed = removed, "Queue drained");
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Spawn a worker for a registered queue
    pub async fn start_worker(
        &self,
        queue: &str,
        processor: Arc<dyn JobProcessor>,
    ) -> WorkerResult<()> {
        let config = self.require_queue(queue)?;
        let worker = Worker::new(
            queue,
            self.backend.clone(),
            processor,
            self.events.clone(),
            WorkerSettings {
                concurrency: config.concurrency,
                poll_interval: self.settings.poll_interval(),
                lock_duration: self.settings.lock_duration(),
            },
        );

        let handle = tokio::spawn(worker.run(self.cancel.child_token()));
        self.tasks
            .lock()
            .await
            .push((format!("worker:{}", queue), handle));
        Ok(())
    }

    /// Spawn the housekeeping scheduler (one per process is enough)
    pub async fn start_scheduler(&self) {
        let scheduler = Scheduler::new(
            self.backend.clone(),
            self.queues.clone(),
            self.events.clone(),
            self.settings.scheduler_tick(),
        );

        let handle = tokio::spawn(scheduler.run(self.cancel.child_token()));
        self.tasks
            .lock()
            .await
            .push(("scheduler".to_string(), handle));
    }

    /// Stop workers and the scheduler, waiting for in-flight jobs
    ///
    /// Tasks still running after the shutdown timeout are aborted; their jobs
    /// are recovered as stalled by the next scheduler that runs.
    pub async fn shutdown(&self) {
        info!("Shutting down job queue manager");
        self.cancel.cancel();

        let (names, handles): (Vec<String>, Vec<JoinHandle<()>>) =
            self.tasks.lock().await.drain(..).unzip();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(self.settings.shutdown_timeout(), join_all(handles)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        error!(task = %name, error = %e, "Task ended abnormally");
                    }
                }
            }
            Err(_) => {
                warn!(tasks = ?names, "Tasks did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        info!("Job queue manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryQueueBackend;
    use serde_json::json;
    use shared::{default_queue_configs, JobPriority, JobState, EMAIL_QUEUE, PAYOUT_QUEUE};
    use std::time::Duration;

    fn manager() -> JobQueueManager {
        let manager = JobQueueManager::new(
            Arc::new(InMemoryQueueBackend::new()),
            QueueSettings::default(),
        );
        for config in default_queue_configs() {
            manager.create_queue(config);
        }
        manager
    }

    #[tokio::test]
    async fn test_add_job_to_unknown_queue() {
        let manager = manager();
        let result = manager
            .add_job("video-transcode", "run", json!({}), JobOptions::default())
            .await;
        assert!(matches!(result, Err(WorkerError::QueueNotFound(q)) if q == "video-transcode"));
    }

    #[tokio::test]
    async fn test_add_job_merges_queue_defaults() {
        let manager = manager();
        let job = manager
            .add_job(PAYOUT_QUEUE, "process-payout", json!({"payout_id": "p1"}), JobOptions::default())
            .await
            .unwrap();

        assert_eq!(job.priority(), JobPriority::High);
        assert_eq!(job.opts.attempts(), 3);
        assert!(job.opts.backoff.is_some());
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_job_options_override_defaults() {
        let manager = manager();
        let job = manager
            .add_job(
                PAYOUT_QUEUE,
                "process-payout",
                json!({}),
                JobOptions::default()
                    .with_priority(JobPriority::Critical)
                    .with_attempts(1),
            )
            .await
            .unwrap();

        assert_eq!(job.priority(), JobPriority::Critical);
        assert_eq!(job.opts.attempts(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_job_id_returns_existing() {
        let manager = manager();
        let opts = JobOptions::default().with_job_id("welcome-42");
        let first = manager
            .add_job(EMAIL_QUEUE, "welcome", json!({"user": 42}), opts.clone())
            .await
            .unwrap();
        let second = manager
            .add_job(EMAIL_QUEUE, "welcome", json!({"user": 99}), opts)
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.data, json!({"user": 42}));
        assert_eq!(manager.queue_stats(EMAIL_QUEUE).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_schedule_job_in_past_runs_now() {
        let manager = manager();
        let job = manager
            .schedule_job(
                EMAIL_QUEUE,
                "reminder",
                json!({}),
                Utc::now() - chrono::Duration::minutes(5),
                JobOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Waiting);

        let later = manager
            .schedule_job(
                EMAIL_QUEUE,
                "reminder",
                json!({}),
                Utc::now() + chrono::Duration::minutes(5),
                JobOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(later.state, JobState::Delayed);

        let stats = manager.queue_stats(EMAIL_QUEUE).await.unwrap();
        assert_eq!((stats.waiting, stats.delayed), (1, 1));
    }

    #[tokio::test]
    async fn test_recurring_job_lifecycle() {
        let manager = manager();
        let repeatable = manager
            .schedule_recurring_job(
                shared::PAYOUT_SYNC_QUEUE,
                "sync-pending-payouts",
                json!({}),
                RepeatOptions::cron("0 */6 * * *"),
                JobOptions::default(),
            )
            .await
            .unwrap();

        assert!(repeatable.next_run_ms > Utc::now().timestamp_millis());
        assert_eq!(repeatable.opts.attempts(), 5);

        let listed = manager.recurring_jobs(shared::PAYOUT_SYNC_QUEUE).await.unwrap();
        assert_eq!(listed.len(), 1);

        assert!(manager
            .remove_recurring_job(shared::PAYOUT_SYNC_QUEUE, &repeatable.key)
            .await
            .unwrap());
        assert!(manager
            .recurring_jobs(shared::PAYOUT_SYNC_QUEUE)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_add_job_rejects_out_of_range_delay() {
        let manager = manager();
        let opts = JobOptions {
            delay_ms: Some(u64::MAX / 2),
            ..JobOptions::default()
        };
        let result = manager.add_job(EMAIL_QUEUE, "reminder", json!({}), opts).await;
        assert!(matches!(
            result,
            Err(WorkerError::Shared(shared::Error::Validation(_)))
        ));
        assert_eq!(manager.queue_stats(EMAIL_QUEUE).await.unwrap().pending(), 0);

        let far = Utc::now() + chrono::Duration::days(10 * 365);
        let result = manager
            .schedule_job(EMAIL_QUEUE, "reminder", json!({}), far, JobOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rescheduling_recurring_job_keeps_count() {
        let manager = manager();
        let repeat = RepeatOptions::every(Duration::from_secs(3600)).with_limit(3);
        let first = manager
            .schedule_recurring_job(EMAIL_QUEUE, "digest", json!({}), repeat.clone(), JobOptions::default())
            .await
            .unwrap();

        let mut ran_twice = first.clone();
        ran_twice.count = 2;
        manager.backend().upsert_repeatable(&ran_twice).await.unwrap();

        let again = manager
            .schedule_recurring_job(EMAIL_QUEUE, "digest", json!({"v": 2}), repeat, JobOptions::default())
            .await
            .unwrap();
        assert_eq!(again.key, first.key);
        assert_eq!(again.count, 2);
        assert_eq!(again.created_at, first.created_at);

        let listed = manager.recurring_jobs(EMAIL_QUEUE).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].count, 2);
        assert_eq!(listed[0].data, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_recurring_job_rejects_bad_pattern() {
        let manager = manager();
        let result = manager
            .schedule_recurring_job(
                EMAIL_QUEUE,
                "digest",
                json!({}),
                RepeatOptions::cron("every tuesday"),
                JobOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(WorkerError::InvalidSchedule(_))));
    }

    #[tokio::test]
    async fn test_create_queue_replaces_config() {
        let manager = manager();
        manager.create_queue(QueueConfig::new(EMAIL_QUEUE).with_concurrency(10));

        assert_eq!(manager.queue_config(EMAIL_QUEUE).unwrap().concurrency, 10);
        assert_eq!(manager.queue_names().len(), 3);
    }

    #[tokio::test]
    async fn test_all_queue_stats_lists_every_queue() {
        let manager = manager();
        manager
            .add_job(EMAIL_QUEUE, "welcome", json!({}), JobOptions::default())
            .await
            .unwrap();

        let stats = manager.all_queue_stats().await.unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[EMAIL_QUEUE].waiting, 1);
        assert_eq!(stats[PAYOUT_QUEUE].pending(), 0);
    }

    #[tokio::test]
    async fn test_retry_unknown_failed_job() {
        let manager = manager();
        let result = manager.retry_failed_job(EMAIL_QUEUE, "nope").await;
        assert!(matches!(result, Err(WorkerError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_pause_resume_and_drain() {
        let manager = manager();
        manager
            .add_job(EMAIL_QUEUE, "welcome", json!({}), JobOptions::default())
            .await
            .unwrap();

        manager.pause_queue(EMAIL_QUEUE).await.unwrap();
        assert!(manager.is_paused(EMAIL_QUEUE).await.unwrap());
        manager.resume_queue(EMAIL_QUEUE).await.unwrap();
        assert!(!manager.is_paused(EMAIL_QUEUE).await.unwrap());

        assert_eq!(manager.drain_queue(EMAIL_QUEUE).await.unwrap(), 1);
        assert_eq!(manager.queue_stats(EMAIL_QUEUE).await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_added_event_is_published() {
        let manager = manager();
        let mut events = manager.subscribe();

        let job = manager
            .add_job(
                EMAIL_QUEUE,
                "reminder",
                json!({}),
                JobOptions::default().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            JobEvent::Added {
                queue: EMAIL_QUEUE.to_string(),
                job_id: job.id,
                name: "reminder".to_string(),
                delayed: true,
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_without_tasks() {
        let manager = manager();
        manager.start_scheduler().await;
        manager.shutdown().await;
    }
}
