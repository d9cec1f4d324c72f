//! Job processors
//!
//! A processor turns a claimed [`Job`] into a result. Returning an error
//! lets the worker decide between a retry and a permanent failure based on
//! [`WorkerError::is_retryable`](crate::error::WorkerError::is_retryable).

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use shared::Job;

use crate::error::WorkerResult;

pub mod webhook;

pub use webhook::{HttpClient, HttpResponse, ReqwestHttpClient, WebhookConfig, WebhookProcessor};

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process one job, returning the value stored as its result
    async fn process(&self, job: &Job) -> WorkerResult<Value>;
}

/// Adapter turning an async closure into a [`JobProcessor`]
pub struct FnProcessor<F> {
    f: F,
}

impl<F, Fut> FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkerResult<Value>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkerResult<Value>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> WorkerResult<Value> {
        (self.f)(job.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use serde_json::json;
    use shared::JobOptions;

    #[tokio::test]
    async fn test_fn_processor_passes_job() {
        let processor = FnProcessor::new(|job: Job| async move { Ok(json!({"echo": job.name})) });
        let job = Job::new("email", "welcome", json!({}), JobOptions::default());

        assert_eq!(processor.process(&job).await.unwrap(), json!({"echo": "welcome"}));
    }

    #[tokio::test]
    async fn test_fn_processor_propagates_errors() {
        let processor =
            FnProcessor::new(|_job: Job| async move { Err(WorkerError::rejected("bad address")) });
        let job = Job::new("email", "welcome", json!({}), JobOptions::default());

        assert!(matches!(
            processor.process(&job).await,
            Err(WorkerError::Rejected(_))
        ));
    }
}
