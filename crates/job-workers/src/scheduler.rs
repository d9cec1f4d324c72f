//! Queue housekeeping loop
//!
//! On every tick, for each registered queue:
//! 1. promote delayed jobs whose run time has come
//! 2. return jobs with expired locks to waiting
//! 3. enqueue due runs of repeatable jobs and advance their schedule
//! 4. refresh the queue depth gauges
//!
//! Runs of repeatable jobs get the deterministic id `repeat:{key}:{run_ms}`,
//! so several scheduler instances racing on the same run enqueue it once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared::{Job, QueueConfig, RepeatableJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::QueueBackend;
use crate::error::WorkerResult;
use crate::events::{EventBus, JobEvent};
use crate::metrics;
use crate::schedule::RepeatSchedule;

/// What one tick did, summed over all queues
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: u64,
    pub stalled: u64,
    pub repeated: u64,
}

pub struct Scheduler {
    backend: Arc<dyn QueueBackend>,
    queues: Arc<DashMap<String, QueueConfig>>,
    events: EventBus,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        queues: Arc<DashMap<String, QueueConfig>>,
        events: EventBus,
        tick_interval: Duration,
    ) -> Self {
        Self {
            backend,
            queues,
            events,
            tick_interval,
        }
    }

    /// Tick until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            "Queue scheduler started"
        );
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Queue scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if report != TickReport::default() {
                        debug!(
                            promoted = report.promoted,
                            stalled = report.stalled,
                            repeated = report.repeated,
                            "Scheduler tick"
                        );
                    }
                }
            }
        }
    }

    /// Run one housekeeping pass as of `now`
    ///
    /// A failing queue is logged and skipped; the other queues still run.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let names: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        let mut report = TickReport::default();

        for queue in names {
            if let Err(e) = self.tick_queue(&queue, now, &mut report).await {
                error!(queue = %queue, error = %e, "Scheduler pass failed");
            }
        }

        report
    }

    async fn tick_queue(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> WorkerResult<()> {
        report.promoted += self.backend.promote_delayed(queue, now).await?;

        let stalled = self.backend.recover_stalled(queue, now).await?;
        if !stalled.is_empty() {
            warn!(queue = queue, count = stalled.len(), "Recovered stalled jobs");
            metrics::record_stalled(queue, stalled.len() as u64);
            report.stalled += stalled.len() as u64;
            for job_id in stalled {
                self.events.emit(JobEvent::Stalled {
                    queue: queue.to_string(),
                    job_id,
                });
            }
        }

        for repeatable in self.backend.repeatables(queue).await? {
            if repeatable.next_run_ms > now.timestamp_millis() {
                continue;
            }
            match self.run_repeatable(repeatable, now).await {
                Ok(true) => report.repeated += 1,
                Ok(false) => {}
                Err(e) => warn!(queue = queue, error = %e, "Failed to enqueue repeatable job"),
            }
        }

        let counts = self.backend.counts(queue).await?;
        metrics::set_queue_depth(queue, &counts);

        Ok(())
    }

    /// Enqueue the due run of a repeatable and advance it
    ///
    /// Returns whether this call added the run (false when another scheduler
    /// got there first).
    async fn run_repeatable(&self, mut repeatable: RepeatableJob, now: DateTime<Utc>) -> WorkerResult<bool> {
        let schedule = RepeatSchedule::parse(&repeatable.repeat)?;
        let run_ms = repeatable.next_run_ms;

        let mut opts = repeatable.opts.clone();
        opts.job_id = Some(repeatable.run_job_id(run_ms));
        opts.delay_ms = None;

        let mut job = Job::new(&repeatable.queue, &repeatable.name, repeatable.data.clone(), opts);
        job.repeat_key = Some(repeatable.key.clone());

        let added = self.backend.add(&job).await?;
        if added {
            debug!(
                queue = %repeatable.queue,
                key = %repeatable.key,
                job_id = %job.id,
                "Enqueued repeatable run"
            );
            self.events.emit(JobEvent::Added {
                queue: job.queue.clone(),
                job_id: job.id.clone(),
                name: job.name.clone(),
                delayed: false,
            });
        }

        repeatable.count += 1;
        if repeatable.limit_reached() {
            info!(
                queue = %repeatable.queue,
                key = %repeatable.key,
                count = repeatable.count,
                "Repeatable job reached its limit"
            );
            self.backend
                .remove_repeatable(&repeatable.queue, &repeatable.key)
                .await?;
            return Ok(added);
        }

        // Skip runs missed while no scheduler was up
        let from = now.max(DateTime::from_timestamp_millis(run_ms).unwrap_or(now));
        match schedule.next_after(from) {
            Some(next) => {
                repeatable.next_run_ms = next.timestamp_millis();
                self.backend.upsert_repeatable(&repeatable).await?;
            }
            None => {
                info!(key = %repeatable.key, "Repeatable job has no further runs");
                self.backend
                    .remove_repeatable(&repeatable.queue, &repeatable.key)
                    .await?;
            }
        }

        Ok(added)
    }
}
