//! Webhook delivery
//!
//! Payout and email business logic lives in the LMS API. Workers hand each
//! job to an HTTP endpoint there and record the response as the job result.
//!
//! Response handling:
//! - 2xx: success, the JSON body (or `null`) becomes the return value
//! - 408, 429, 5xx and transport errors: retryable
//! - any other status: the job is rejected without further attempts

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use shared::Job;

use super::JobProcessor;
use crate::error::{WorkerError, WorkerResult};
use crate::retry::{execute_with_retry, RetryPolicy};

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum URL length
const MAX_URL_LENGTH: usize = 2048;

/// Longest response excerpt included in error messages
const MAX_BODY_EXCERPT: usize = 200;

/// Endpoint a queue's jobs are delivered to
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
    /// Sent as a bearer token when set
    pub auth_token: Option<String>,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
            auth_token: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Check URL format and scheme, and that the timeout is sane
    pub fn validate(&self) -> WorkerResult<()> {
        validate_url(&self.url)?;

        if self.timeout.is_zero() || self.timeout > Duration::from_secs(300) {
            return Err(WorkerError::invalid_config(
                "Webhook timeout must be between 1ms and 300 seconds",
            ));
        }

        Ok(())
    }
}

fn validate_url(url: &str) -> WorkerResult<()> {
    if url.is_empty() {
        return Err(WorkerError::invalid_config("Webhook URL cannot be empty"));
    }

    if url.len() > MAX_URL_LENGTH {
        return Err(WorkerError::invalid_config(format!(
            "Webhook URL too long: {} characters (max: {})",
            url.len(),
            MAX_URL_LENGTH
        )));
    }

    let parsed = url::Url::parse(url)
        .map_err(|e| WorkerError::invalid_config(format!("Invalid webhook URL: {}", e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(WorkerError::invalid_config(format!(
            "Unsupported URL scheme: {} (only http/https allowed)",
            parsed.scheme()
        )));
    }

    Ok(())
}

/// One delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub body: Value,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    /// Stable across retries so the receiver can deduplicate
    pub idempotency_key: String,
}

/// HTTP response details
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<Value>,
}

/// HTTP client seam for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST the request body as JSON
    ///
    /// Only transport failures are errors; any HTTP status is a response.
    async fn post_json(&self, request: &WebhookRequest) -> WorkerResult<HttpResponse>;
}

/// Reqwest-based HTTP client with connection pooling
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> WorkerResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("lms-job-workers/1.0")
            .build()
            .map_err(|e| {
                WorkerError::invalid_config(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post_json(&self, request: &WebhookRequest) -> WorkerResult<HttpResponse> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&request.body);

        if let Some(token) = &request.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                WorkerError::timeout(format!(
                    "Webhook request timed out after {}ms",
                    request.timeout.as_millis()
                ))
            } else if e.is_connect() {
                WorkerError::delivery("Connection to webhook failed")
            } else {
                WorkerError::delivery(format!("Webhook request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| WorkerError::delivery(format!("Failed to read webhook response: {}", e)))?;

        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };

        Ok(HttpResponse { status, body })
    }
}

/// Classify a response by status code
fn check_status(response: HttpResponse) -> WorkerResult<HttpResponse> {
    match response.status {
        200..=299 => Ok(response),
        408 | 429 | 500..=599 => Err(WorkerError::delivery(describe(&response))),
        _ => Err(WorkerError::rejected(describe(&response))),
    }
}

fn describe(response: &HttpResponse) -> String {
    match &response.body {
        Some(body) => {
            let excerpt: String = body.to_string().chars().take(MAX_BODY_EXCERPT).collect();
            format!("webhook returned HTTP {}: {}", response.status, excerpt)
        }
        None => format!("webhook returned HTTP {}", response.status),
    }
}

/// Processor delivering jobs to a webhook
pub struct WebhookProcessor<C: HttpClient> {
    client: Arc<C>,
    config: WebhookConfig,
    retry_policy: RetryPolicy,
}

impl<C: HttpClient> WebhookProcessor<C> {
    /// Create a processor; fails when the endpoint config is invalid
    pub fn new(client: Arc<C>, config: WebhookConfig, retry_policy: RetryPolicy) -> WorkerResult<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            retry_policy,
        })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    fn request_for(&self, job: &Job) -> WebhookRequest {
        WebhookRequest {
            url: self.config.url.clone(),
            body: json!({
                "id": job.id,
                "queue": job.queue,
                "name": job.name,
                "data": job.data,
                "attempt": job.attempts_made + 1,
            }),
            auth_token: self.config.auth_token.clone(),
            timeout: self.config.timeout,
            idempotency_key: job.id.clone(),
        }
    }
}

#[async_trait]
impl<C: HttpClient> JobProcessor for WebhookProcessor<C> {
    async fn process(&self, job: &Job) -> WorkerResult<Value> {
        let request = self.request_for(job);
        let client = &self.client;
        let request = &request;

        tracing::debug!(
            queue = %job.queue,
            job_id = %job.id,
            name = %job.name,
            "Delivering job to webhook"
        );

        let response = execute_with_retry(&self.retry_policy, &job.queue, || async move {
            let response = client.post_json(request).await?;
            check_status(response)
        })
        .await?;

        Ok(response.body.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use shared::JobOptions;

    mock! {
        pub Http {}

        #[async_trait]
        impl HttpClient for Http {
            async fn post_json(&self, request: &WebhookRequest) -> WorkerResult<HttpResponse>;
        }
    }

    fn processor(client: MockHttp) -> WebhookProcessor<MockHttp> {
        WebhookProcessor::new(
            Arc::new(client),
            WebhookConfig::new("https://lms.example.com/internal/jobs/email")
                .with_auth_token("secret"),
            RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(10)),
        )
        .unwrap()
    }

    fn email_job() -> Job {
        Job::new(
            "email",
            "send-welcome",
            json!({"to": "student@example.com"}),
            JobOptions::default().with_job_id("email-1"),
        )
    }

    fn respond(status: u16, body: Option<Value>) -> WorkerResult<HttpResponse> {
        Ok(HttpResponse { status, body })
    }

    #[test]
    fn test_config_validation() {
        assert!(WebhookConfig::new("https://lms.example.com/jobs").validate().is_ok());
        assert!(WebhookConfig::new("http://localhost:3000/jobs").validate().is_ok());
        assert!(WebhookConfig::new("").validate().is_err());
        assert!(WebhookConfig::new("ftp://lms.example.com").validate().is_err());
        assert!(WebhookConfig::new("not a url").validate().is_err());
        assert!(WebhookConfig::new("https://lms.example.com")
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());

        let long = format!("https://lms.example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(WebhookConfig::new(long).validate().is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(check_status(HttpResponse { status: 204, body: None }).is_ok());

        for status in [408, 429, 500, 503] {
            let err = check_status(HttpResponse { status, body: None }).unwrap_err();
            assert!(err.is_retryable(), "{} should be retryable", status);
        }

        for status in [400, 401, 404, 422] {
            let err = check_status(HttpResponse { status, body: None }).unwrap_err();
            assert!(!err.is_retryable(), "{} should be permanent", status);
        }
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let mut client = MockHttp::new();
        client
            .expect_post_json()
            .times(1)
            .withf(|req: &WebhookRequest| {
                req.body["id"] == "email-1"
                    && req.body["name"] == "send-welcome"
                    && req.body["attempt"] == 1
                    && req.idempotency_key == "email-1"
                    && req.auth_token.as_deref() == Some("secret")
            })
            .returning(|_| respond(200, Some(json!({"message_id": "m-1"}))));

        let value = processor(client).process(&email_job()).await.unwrap();
        assert_eq!(value, json!({"message_id": "m-1"}));
    }

    #[tokio::test]
    async fn test_empty_body_is_null() {
        let mut client = MockHttp::new();
        client.expect_post_json().returning(|_| respond(202, None));

        let value = processor(client).process(&email_job()).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_server_error_is_retried_in_process() {
        let mut client = MockHttp::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_post_json()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| respond(503, None));
        client
            .expect_post_json()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| respond(200, Some(json!({"ok": true}))));

        let value = processor(client).process(&email_job()).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let mut client = MockHttp::new();
        client
            .expect_post_json()
            .times(1)
            .returning(|_| respond(422, Some(json!({"error": "invalid recipient"}))));

        let err = processor(client).process(&email_job()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Rejected(_)));
        assert!(err.to_string().contains("invalid recipient"));
    }

    #[tokio::test]
    async fn test_transport_error_is_retryable() {
        let mut client = MockHttp::new();
        client
            .expect_post_json()
            .times(2)
            .returning(|_| Err(WorkerError::delivery("Connection to webhook failed")));

        let err = processor(client).process(&email_job()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = WebhookProcessor::new(
            Arc::new(MockHttp::new()),
            WebhookConfig::new("mailto:ops@example.com"),
            RetryPolicy::none(),
        );
        assert!(matches!(result, Err(WorkerError::InvalidConfig(_))));
    }
}
