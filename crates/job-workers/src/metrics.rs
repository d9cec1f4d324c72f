//! Job worker metrics
//!
//! Recorded through the `metrics` facade; the binary installs the Prometheus
//! exporter when `METRICS_ADDR` is set. Labels are limited to queue names,
//! job states and attempt numbers to keep cardinality bounded.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use shared::QueueCounts;

/// Register metric descriptions (shown as HELP lines by the exporter)
pub fn describe_metrics() {
    describe_counter!(
        "job_worker_jobs_processed_total",
        "Total jobs processed, by queue and status"
    );
    describe_histogram!(
        "job_worker_job_duration_seconds",
        "Job processing duration in seconds"
    );
    describe_counter!("job_worker_retries_total", "Total retry attempts");
    describe_counter!(
        "job_worker_stalled_jobs_total",
        "Jobs recovered after their lock expired"
    );
    describe_gauge!("job_worker_queue_depth", "Jobs per queue and state");
    describe_gauge!("job_worker_active_jobs", "Jobs currently being processed");
    describe_gauge!("job_worker_active_workers", "Running workers");
}

/// Record a successful job completion
pub fn record_job_success(queue: &str, duration_secs: f64) {
    counter!("job_worker_jobs_processed_total", "queue" => queue.to_string(), "status" => "success")
        .increment(1);
    histogram!("job_worker_job_duration_seconds", "queue" => queue.to_string())
        .record(duration_secs);
}

/// Record a job that failed for good
pub fn record_job_failure(queue: &str, duration_secs: f64) {
    counter!("job_worker_jobs_processed_total", "queue" => queue.to_string(), "status" => "failure")
        .increment(1);
    histogram!("job_worker_job_duration_seconds", "queue" => queue.to_string())
        .record(duration_secs);
}

/// Record a retry attempt
pub fn record_retry(queue: &str, attempt: u32) {
    counter!(
        "job_worker_retries_total",
        "queue" => queue.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

pub fn record_stalled(queue: &str, count: u64) {
    counter!("job_worker_stalled_jobs_total", "queue" => queue.to_string()).increment(count);
}

/// Publish the per-state job counts of a queue
pub fn set_queue_depth(queue: &str, counts: &QueueCounts) {
    for (state, value) in [
        ("waiting", counts.waiting),
        ("delayed", counts.delayed),
        ("active", counts.active),
        ("completed", counts.completed),
        ("failed", counts.failed),
    ] {
        gauge!("job_worker_queue_depth", "queue" => queue.to_string(), "state" => state)
            .set(value as f64);
    }
}

pub fn job_started(queue: &str) {
    gauge!("job_worker_active_jobs", "queue" => queue.to_string()).increment(1.0);
}

pub fn job_finished(queue: &str) {
    gauge!("job_worker_active_jobs", "queue" => queue.to_string()).decrement(1.0);
}

pub fn worker_started(queue: &str) {
    gauge!("job_worker_active_workers", "queue" => queue.to_string()).increment(1.0);
}

pub fn worker_stopped(queue: &str) {
    gauge!("job_worker_active_workers", "queue" => queue.to_string()).decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_without_recorder() {
        // No recorder installed: every call must be a no-op
        describe_metrics();
        record_job_success("email", 0.5);
        record_job_failure("payout", 1.0);
        record_retry("payout", 2);
        record_stalled("email", 3);
        set_queue_depth("email", &QueueCounts::default());
        job_started("email");
        job_finished("email");
        worker_started("email");
        worker_stopped("email");
    }
}
