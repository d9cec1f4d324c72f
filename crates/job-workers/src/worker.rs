//! Per-queue worker
//!
//! One worker consumes one queue. At most `concurrency` jobs run at once,
//! bounded by a semaphore: a permit is taken before fetching and released
//! when the job's outcome has been written back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use shared::Job;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::QueueBackend;
use crate::error::{WorkerError, WorkerResult};
use crate::events::{EventBus, JobEvent};
use crate::metrics;
use crate::processors::JobProcessor;

/// Tuning knobs of a worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// How long a fetched job stays locked without renewal
    pub lock_duration: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            lock_duration: Duration::from_secs(30),
        }
    }
}

/// Consumer of one queue
#[derive(Clone)]
pub struct Worker {
    queue: String,
    id: String,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<dyn JobProcessor>,
    events: EventBus,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        processor: Arc<dyn JobProcessor>,
        events: EventBus,
        settings: WorkerSettings,
    ) -> Self {
        let queue = queue.into();
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let id = format!("{}:{}:{}", host, queue, &uuid::Uuid::new_v4().to_string()[..8]);

        Self {
            queue,
            id,
            backend,
            processor,
            events,
            settings: WorkerSettings {
                concurrency: settings.concurrency.max(1),
                ..settings
            },
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `cancel` fires, then wait for in-flight jobs
    pub async fn run(self, cancel: CancellationToken) {
        let concurrency = self.settings.concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));

        info!(
            queue = %self.queue,
            worker_id = %self.id,
            concurrency = concurrency,
            "Worker started"
        );
        metrics::worker_started(&self.queue);

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.backend.fetch_next(&self.queue, self.settings.lock_duration).await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle(&cancel, self.settings.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(queue = %self.queue, error = %e, "Failed to fetch next job");
                    if self.idle(&cancel, self.settings.poll_interval * 2).await {
                        break;
                    }
                }
            }
        }

        debug!(queue = %self.queue, "Waiting for in-flight jobs");
        let _ = semaphore.acquire_many(concurrency as u32).await;

        metrics::worker_stopped(&self.queue);
        info!(queue = %self.queue, worker_id = %self.id, "Worker stopped");
    }

    /// Sleep unless cancelled first; returns true on cancellation
    async fn idle(&self, cancel: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Run one claimed job to an outcome
    pub async fn process(&self, mut job: Job) {
        let started = Instant::now();
        metrics::job_started(&self.queue);

        self.events.emit(JobEvent::Active {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            name: job.name.clone(),
            attempt: job.attempts_made + 1,
        });

        let renewal = self.spawn_lock_renewal(&job);
        let result = self.run_processor(&job).await;
        renewal.cancel();

        job.attempts_made += 1;
        let outcome = match result {
            Ok(value) => self.on_success(&job, value, started).await,
            Err(e) => self.on_failure(&job, e, started).await,
        };

        if let Err(e) = outcome {
            error!(
                queue = %self.queue,
                job_id = %job.id,
                error = %e,
                "Failed to record job outcome"
            );
        }

        metrics::job_finished(&self.queue);
    }

    async fn run_processor(&self, job: &Job) -> WorkerResult<Value> {
        match job.opts.timeout() {
            Some(limit) => tokio::time::timeout(limit, self.processor.process(job))
                .await
                .unwrap_or_else(|_| {
                    Err(WorkerError::timeout(format!(
                        "job exceeded {}ms",
                        limit.as_millis()
                    )))
                }),
            None => self.processor.process(job).await,
        }
    }

    /// Keep the job's lock alive while it is processed
    fn spawn_lock_renewal(&self, job: &Job) -> CancellationToken {
        let token = CancellationToken::new();
        let child = token.clone();
        let backend = self.backend.clone();
        let queue = self.queue.clone();
        let job_id = job.id.clone();
        let lock_token = job.lock_token.clone().unwrap_or_default();
        let lock = self.settings.lock_duration;
        let every = (lock / 2).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        match backend.extend_lock(&queue, &job_id, &lock_token, lock).await {
                            Ok(true) => {}
                            Ok(false) => {
                                if !child.is_cancelled() {
                                    warn!(queue = %queue, job_id = %job_id, "Job lock lost during processing");
                                }
                                break;
                            }
                            Err(e) => {
                                warn!(queue = %queue, job_id = %job_id, error = %e, "Failed to extend job lock");
                            }
                        }
                    }
                }
            }
        });

        token
    }

    async fn on_success(&self, job: &Job, value: Value, started: Instant) -> WorkerResult<()> {
        let elapsed = started.elapsed();

        if !self.backend.complete(job, value).await? {
            warn!(
                queue = %self.queue,
                job_id = %job.id,
                "Job finished after its lock expired, result discarded"
            );
            return Ok(());
        }

        info!(
            queue = %self.queue,
            job_id = %job.id,
            name = %job.name,
            attempts_made = job.attempts_made,
            duration_ms = elapsed.as_millis() as u64,
            "Job completed"
        );
        metrics::record_job_success(&self.queue, elapsed.as_secs_f64());

        self.events.emit(JobEvent::Completed {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            name: job.name.clone(),
            attempts_made: job.attempts_made,
            duration_ms: elapsed.as_millis() as u64,
        });

        Ok(())
    }

    async fn on_failure(&self, job: &Job, err: WorkerError, started: Instant) -> WorkerResult<()> {
        let elapsed = started.elapsed();
        let reason = err.failure_reason();

        if err.is_retryable() && job.can_retry() {
            let delay = job.retry_delay();
            if !self.backend.retry(job, delay, &reason).await? {
                warn!(queue = %self.queue, job_id = %job.id, "Job lock lost before retry");
                return Ok(());
            }

            warn!(
                queue = %self.queue,
                job_id = %job.id,
                name = %job.name,
                attempts_made = job.attempts_made,
                max_attempts = job.opts.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Job failed, retrying"
            );
            metrics::record_retry(&self.queue, job.attempts_made);

            self.events.emit(JobEvent::Retrying {
                queue: job.queue.clone(),
                job_id: job.id.clone(),
                name: job.name.clone(),
                attempts_made: job.attempts_made,
                delay_ms: delay.as_millis() as u64,
                error: reason,
            });
            return Ok(());
        }

        if !self.backend.fail(job, &reason).await? {
            warn!(queue = %self.queue, job_id = %job.id, "Job lock lost before failure");
            return Ok(());
        }

        error!(
            queue = %self.queue,
            job_id = %job.id,
            name = %job.name,
            attempts_made = job.attempts_made,
            retryable = err.is_retryable(),
            error = %err,
            "Job failed"
        );
        metrics::record_job_failure(&self.queue, elapsed.as_secs_f64());

        self.events.emit(JobEvent::Failed {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            name: job.name.clone(),
            attempts_made: job.attempts_made,
            error: reason,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryQueueBackend;
    use crate::processors::FnProcessor;
    use async_trait::async_trait;
    use mockall::mock;
    use serde_json::json;
    use shared::{Backoff, JobOptions, JobState};

    mock! {
        pub Processor {}

        #[async_trait]
        impl JobProcessor for Processor {
            async fn process(&self, job: &Job) -> WorkerResult<Value>;
        }
    }

    fn worker(backend: Arc<InMemoryQueueBackend>, processor: Arc<dyn JobProcessor>) -> Worker {
        Worker::new(
            "email",
            backend,
            processor,
            EventBus::default(),
            WorkerSettings {
                concurrency: 2,
                poll_interval: Duration::from_millis(10),
                lock_duration: Duration::from_secs(5),
            },
        )
    }

    async fn claim(backend: &InMemoryQueueBackend, opts: JobOptions) -> Job {
        let job = Job::new("email", "welcome", json!({"to": "a@example.com"}), opts);
        backend.add(&job).await.unwrap();
        backend
            .fetch_next("email", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let mut processor = MockProcessor::new();
        processor
            .expect_process()
            .times(1)
            .returning(|_| Ok(json!({"sent": true})));

        let worker = worker(backend.clone(), Arc::new(processor));
        let mut events = worker.events.subscribe();
        let job = claim(&backend, JobOptions::default()).await;

        worker.process(job.clone()).await;

        let stored = backend.get_job("email", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts_made, 1);
        assert_eq!(stored.return_value, Some(json!({"sent": true})));

        assert!(matches!(events.recv().await.unwrap(), JobEvent::Active { attempt: 1, .. }));
        assert!(matches!(events.recv().await.unwrap(), JobEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn test_retryable_error_schedules_retry() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let mut processor = MockProcessor::new();
        processor
            .expect_process()
            .returning(|_| Err(WorkerError::delivery("HTTP 503")));

        let worker = worker(backend.clone(), Arc::new(processor));
        let opts = JobOptions::default()
            .with_attempts(3)
            .with_backoff(Backoff::exponential(Duration::from_secs(2)));
        let job = claim(&backend, opts).await;

        worker.process(job.clone()).await;

        let stored = backend.get_job("email", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert_eq!(stored.attempts_made, 1);
        assert!(stored.failed_reason.unwrap().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_last_attempt_fails_job() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let mut processor = MockProcessor::new();
        processor
            .expect_process()
            .returning(|_| Err(WorkerError::delivery("HTTP 503")));

        let worker = worker(backend.clone(), Arc::new(processor));
        let mut events = worker.events.subscribe();
        let mut job = claim(&backend, JobOptions::default().with_attempts(2)).await;
        job.attempts_made = 1;

        worker.process(job.clone()).await;

        let stored = backend.get_job("email", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts_made, 2);

        let _active = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            JobEvent::Failed { attempts_made, .. } => assert_eq!(attempts_made, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_skips_remaining_attempts() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let mut processor = MockProcessor::new();
        processor
            .expect_process()
            .times(1)
            .returning(|_| Err(WorkerError::rejected("HTTP 422")));

        let worker = worker(backend.clone(), Arc::new(processor));
        let job = claim(&backend, JobOptions::default().with_attempts(5)).await;

        worker.process(job.clone()).await;

        let stored = backend.get_job("email", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(backend.counts("email").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable_failure() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let processor = FnProcessor::new(|_job: Job| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });

        let worker = worker(backend.clone(), Arc::new(processor));
        let opts = JobOptions {
            attempts: Some(2),
            timeout_ms: Some(20),
            ..JobOptions::default()
        };
        let job = claim(&backend, opts).await;

        worker.process(job.clone()).await;

        let stored = backend.get_job("email", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert!(stored.failed_reason.unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_result_of_superseded_claim_is_discarded() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let processor = FnProcessor::new(|_job: Job| async move { Ok(json!("stale")) });
        let worker = worker(backend.clone(), Arc::new(processor));

        let first = claim(&backend, JobOptions::default()).await;
        let later = chrono::Utc::now() + chrono::Duration::seconds(10);
        backend.recover_stalled("email", later).await.unwrap();
        let second = backend
            .fetch_next("email", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        worker.process(first).await;

        let stored = backend.get_job("email", &second.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Active);
        assert!(stored.return_value.is_none());
        assert!(backend.complete(&second, json!("fresh")).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_cancel() {
        let backend = Arc::new(InMemoryQueueBackend::new());
        for i in 0..5 {
            let job = Job::new("email", "digest", json!({"n": i}), JobOptions::default());
            backend.add(&job).await.unwrap();
        }

        let processor = FnProcessor::new(|job: Job| async move { Ok(job.data) });
        let worker = worker(backend.clone(), Arc::new(processor));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        for _ in 0..100 {
            if backend.counts("email").await.unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();

        let counts = backend.counts("email").await.unwrap();
        assert_eq!(counts.completed, 5);
        assert_eq!(counts.pending(), 0);
    }
}
