//! Redis-backed job queues for the LMS
//!
//! Producers enqueue through [`JobQueueManager`]; workers pull jobs from the
//! queue backend, run them through a [`JobProcessor`] and record the outcome.
//! A [`Scheduler`] promotes delayed jobs, recovers stalled ones and enqueues
//! runs of repeatable jobs.

pub mod backend;
pub mod error;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod processors;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod worker;

pub use backend::{InMemoryQueueBackend, QueueBackend, RedisQueueBackend};
pub use error::{WorkerError, WorkerResult};
pub use events::{EventBus, JobEvent};
pub use manager::JobQueueManager;
pub use processors::{FnProcessor, JobProcessor, WebhookConfig, WebhookProcessor};
pub use retry::RetryPolicy;
pub use schedule::RepeatSchedule;
pub use scheduler::{Scheduler, TickReport};
pub use worker::{Worker, WorkerSettings};
