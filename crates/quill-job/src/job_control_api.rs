use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;

use quill_events::JobId;

use crate::generation_request::GenerationRequest;
use crate::job_state::JobError;

pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONTROL_MAX_RETRIES: usize = 2;
const BASE_BACKOFF_MS: u64 = 200;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
/// Public struct `StartJobAccepted` used across Quill components.
///
/// The job-control API's answer to a start request: the job id plus the
/// endpoints to stream from and to cancel with.
pub struct StartJobAccepted {
    pub job_id: JobId,
    pub stream_url: String,
    pub cancel_url: String,
}

#[async_trait]
/// Trait contract for `JobControlClient` behavior.
///
/// Seam for the external job-control collaborator so the runtime can be
/// exercised against a counting fake in tests.
pub trait JobControlClient: Send + Sync {
    async fn start_job(&self, request: &GenerationRequest) -> Result<StartJobAccepted, JobError>;

    /// Idempotent on the server: repeated cancels for the same job succeed.
    async fn cancel_job(&self, cancel_url: &str, job_id: &JobId) -> Result<(), JobError>;
}

#[derive(Debug, Clone)]
/// Public struct `JobControlApiConfig` used across Quill components.
pub struct JobControlApiConfig {
    pub api_base: String,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
}

impl JobControlApiConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            request_timeout_ms: DEFAULT_CONTROL_TIMEOUT_MS,
            max_retries: DEFAULT_CONTROL_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
/// Public struct `JobControlApi` used across Quill components.
pub struct JobControlApi {
    client: reqwest::Client,
    config: JobControlApiConfig,
}

impl JobControlApi {
    pub fn new(config: JobControlApiConfig) -> Result<Self, JobError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;
        Ok(Self { client, config })
    }

    fn generations_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        format!("{base}/generations")
    }

    /// Cancel URLs from the server may be absolute or base-relative.
    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        let base = self.config.api_base.trim_end_matches('/');
        format!("{base}/{}", url.trim_start_matches('/'))
    }

    async fn post_with_retry(
        &self,
        url: &str,
        body: Option<&GenerationRequest>,
    ) -> Result<String, JobError> {
        let max_retries = self.config.max_retries;
        for attempt in 0..=max_retries {
            let mut request = self
                .client
                .post(url)
                .header("x-quill-retry-attempt", attempt.to_string());
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let raw = response.text().await?;
                    if status.is_success() {
                        return Ok(raw);
                    }
                    if attempt < max_retries && should_retry_status(status.as_u16()) {
                        sleep(std::time::Duration::from_millis(next_backoff_ms(attempt))).await;
                        continue;
                    }
                    return Err(JobError::HttpStatus {
                        status: status.as_u16(),
                        body: raw,
                    });
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_http_error(&error) {
                        sleep(std::time::Duration::from_millis(next_backoff_ms(attempt))).await;
                        continue;
                    }
                    return Err(JobError::Http(error));
                }
            }
        }

        Err(JobError::InvalidResponse(
            "request retry loop terminated unexpectedly".to_string(),
        ))
    }
}

#[async_trait]
impl JobControlClient for JobControlApi {
    async fn start_job(&self, request: &GenerationRequest) -> Result<StartJobAccepted, JobError> {
        let raw = self
            .post_with_retry(&self.generations_url(), Some(request))
            .await?;
        let accepted: StartJobAccepted = serde_json::from_str(&raw)?;
        if accepted.stream_url.trim().is_empty() {
            return Err(JobError::InvalidResponse(
                "start response is missing a stream url".to_string(),
            ));
        }
        Ok(accepted)
    }

    async fn cancel_job(&self, cancel_url: &str, job_id: &JobId) -> Result<(), JobError> {
        let url = self.resolve_url(cancel_url);
        tracing::debug!(job_id = %job_id, url = url.as_str(), "requesting job cancellation");
        self.post_with_retry(&url, None).await?;
        Ok(())
    }
}

fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

fn next_backoff_ms(attempt: usize) -> u64 {
    let shift = attempt.min(6);
    BASE_BACKOFF_MS.saturating_mul(1_u64 << shift)
}

fn is_retryable_http_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use quill_events::JobId;

    use super::{
        next_backoff_ms, should_retry_status, JobControlApi, JobControlApiConfig, JobControlClient,
    };
    use crate::generation_request::{GenerationRequest, ScriptType};
    use crate::job_state::JobError;

    fn request() -> GenerationRequest {
        GenerationRequest {
            project_id: "proj-1".to_string(),
            episode_number: Some(1),
            description: "A pilot episode about a lighthouse keeper.".to_string(),
            script_type: ScriptType::Screenplay,
            model: Some("quill-large".to_string()),
            temperature: 0.7,
            target_length_words: 3_000,
        }
    }

    fn api(base_url: String) -> JobControlApi {
        JobControlApi::new(JobControlApiConfig {
            api_base: base_url,
            request_timeout_ms: 2_000,
            max_retries: 2,
        })
        .expect("control api client")
    }

    #[test]
    fn unit_retry_status_selection_is_correct() {
        assert!(should_retry_status(429));
        assert!(should_retry_status(503));
        assert!(!should_retry_status(400));
        assert!(!should_retry_status(404));
    }

    #[test]
    fn unit_backoff_increases_per_attempt() {
        assert_eq!(next_backoff_ms(0), 200);
        assert_eq!(next_backoff_ms(1), 400);
        assert_eq!(next_backoff_ms(2), 800);
    }

    #[tokio::test]
    async fn functional_start_job_posts_the_request_and_parses_the_answer() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/generations")
                .json_body_includes(
                    json!({
                        "project_id": "proj-1",
                        "script_type": "screenplay",
                        "target_length_words": 3000
                    })
                    .to_string(),
                );
            then.status(200).json_body(json!({
                "job_id": "job-9",
                "stream_url": "http://example.test/jobs/job-9/stream",
                "cancel_url": "/v1/generations/job-9/cancel"
            }));
        });

        let api = api(format!("{}/v1", server.base_url()));
        let accepted = api.start_job(&request()).await.expect("start accepted");
        assert_eq!(accepted.job_id, JobId::new("job-9"));
        assert_eq!(accepted.cancel_url, "/v1/generations/job-9/cancel");
        mock.assert();
    }

    #[tokio::test]
    async fn functional_start_job_retries_transient_statuses_then_succeeds() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/generations")
                .header("x-quill-retry-attempt", "0");
            then.status(503).body("unavailable");
        });
        let second = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/generations")
                .header("x-quill-retry-attempt", "1");
            then.status(200).json_body(json!({
                "job_id": "job-9",
                "stream_url": "http://example.test/jobs/job-9/stream",
                "cancel_url": "/v1/generations/job-9/cancel"
            }));
        });

        let api = api(format!("{}/v1", server.base_url()));
        let accepted = api.start_job(&request()).await.expect("retry succeeds");
        assert_eq!(accepted.job_id, JobId::new("job-9"));
        first.assert_calls(1);
        second.assert_calls(1);
    }

    #[tokio::test]
    async fn regression_start_job_does_not_retry_client_errors() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/generations");
            then.status(400).body("bad request");
        });

        let api = api(format!("{}/v1", server.base_url()));
        let error = api.start_job(&request()).await.expect_err("client error");
        match error {
            JobError::HttpStatus { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad request");
            }
            other => panic!("expected http status error, got {other:?}"),
        }
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn functional_cancel_job_resolves_relative_urls_against_the_base() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/generations/job-9/cancel");
            then.status(200).body("{}");
        });

        let api = api(format!("{}/v1", server.base_url()));
        api.cancel_job("/generations/job-9/cancel", &JobId::new("job-9"))
            .await
            .expect("cancel acknowledged");
        mock.assert();
    }
}
