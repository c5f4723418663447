//! End-to-end scenarios for the generation pipeline: job-control API,
//! stream connection, reconnect policy, and job state machine wired
//! together against a mock server.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use tokio::time::sleep;

use quill_job::{
    GenerationJobRuntime, GenerationJobRuntimeConfig, GenerationRequest, JobControlApi,
    JobControlApiConfig, JobError, JobStatus, ScriptType,
};
use quill_stream::{ConnectionRegistry, LivenessMonitorConfig, ReconnectPolicyConfig};

fn request() -> GenerationRequest {
    GenerationRequest {
        project_id: "proj-lighthouse".to_string(),
        episode_number: Some(2),
        description: "The keeper discovers the lamp has been speaking to ships.".to_string(),
        script_type: ScriptType::Teleplay,
        model: Some("quill-large".to_string()),
        temperature: 0.9,
        target_length_words: 5_000,
    }
}

fn runtime_config(max_retries: usize) -> GenerationJobRuntimeConfig {
    GenerationJobRuntimeConfig {
        connect_timeout: Duration::from_secs(2),
        liveness: LivenessMonitorConfig {
            heartbeat_timeout: Duration::from_secs(10),
            check_interval: Duration::from_millis(20),
        },
        reconnect: ReconnectPolicyConfig {
            backoff_table_ms: vec![50],
            max_retries,
            breaker_window_ms: 60_000,
            breaker_failure_threshold: 50,
            breaker_cooldown_ms: 30_000,
            jitter_enabled: false,
        },
    }
}

fn runtime_against(server: &MockServer, max_retries: usize) -> GenerationJobRuntime {
    let control = JobControlApi::new(JobControlApiConfig {
        api_base: format!("{}/v1", server.base_url()),
        request_timeout_ms: 2_000,
        max_retries: 0,
    })
    .expect("control client");
    GenerationJobRuntime::new(
        runtime_config(max_retries),
        Arc::new(control),
        Arc::new(ConnectionRegistry::new()),
    )
}

fn mock_start_endpoint(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(POST).path("/v1/generations");
        then.status(200).json_body(json!({
            "job_id": "job-42",
            "stream_url": format!("{}/v1/generations/job-42/stream", server.base_url()),
            "cancel_url": "/generations/job-42/cancel"
        }));
    })
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() && tokio::time::Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert!(condition(), "condition not reached before timeout");
}

#[tokio::test]
async fn generation_job_completes_across_a_dropped_stream() {
    let server = MockServer::start();
    let start = mock_start_endpoint(&server);
    // The first stream delivers progress and a heartbeat, then drops
    // without a terminal event.
    let first_stream = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/generations/job-42/stream")
            .header("x-quill-retry-attempt", "0");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                "event: progress\n",
                "data: {\"value\": 40, \"step_label\": \"Drafting act one\"}\n",
                "id: evt-40\n",
                "\n",
                "event: heartbeat\n",
                "data: {\"server_timestamp\": 1712000000000}\n",
                "\n",
            ));
    });
    // The reconnect carries the resumption token and finishes the job.
    let resumed_stream = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/generations/job-42/stream")
            .query_param("last_event_id", "evt-40")
            .header("x-quill-retry-attempt", "1");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                "event: completed\n",
                "data: {\"final_content\": \"X\", \"token_count\": 11, \"word_count\": 8}\n",
                "id: evt-41\n",
                "\n",
            ));
    });

    let mut runtime = runtime_against(&server, 5);
    let job_id = runtime.start(request()).await.expect("job starts");
    assert_eq!(job_id.as_str(), "job-42");

    wait_for(|| runtime.state().status == JobStatus::Completed).await;
    let state = runtime.state();
    assert_eq!(state.final_content.as_deref(), Some("X"));
    assert_eq!(state.token_count, 11);
    assert_eq!(state.progress, 100);
    assert!(state.can_save);
    assert!(state.can_retry);
    assert!(state.error.is_none());

    start.assert_calls(1);
    first_stream.assert_calls(1);
    resumed_stream.assert_calls(1);
}

#[tokio::test]
async fn exhausted_reconnects_surface_a_manual_retry_affordance() {
    let server = MockServer::start();
    mock_start_endpoint(&server);
    let failing_stream = server.mock(|when, then| {
        when.method(GET).path("/v1/generations/job-42/stream");
        then.status(503).body("unavailable");
    });

    let mut runtime = runtime_against(&server, 5);
    runtime.start(request()).await.expect("job starts");

    wait_for(|| runtime.state().status == JobStatus::Failed).await;
    let state = runtime.state();
    assert!(state.can_retry, "manual retry affordance must be offered");
    let failure = state.error.expect("failure recorded");
    assert_eq!(failure.code, "connection_exhausted");
    assert!(failure.retryable);

    // One original attempt plus five retries, then nothing further.
    failing_stream.assert_calls(6);
    sleep(Duration::from_millis(200)).await;
    failing_stream.assert_calls(6);
}

#[tokio::test]
async fn server_declared_failure_is_terminal_and_not_retryable() {
    let server = MockServer::start();
    mock_start_endpoint(&server);
    server.mock(|when, then| {
        when.method(GET).path("/v1/generations/job-42/stream");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                "event: progress\n",
                "data: {\"value\": 15, \"step_label\": \"outline\"}\n",
                "\n",
                "event: failed\n",
                "data: {\"error_code\": \"VALIDATION_ERROR\", \"error_message\": \"prompt rejected\", \"retryable\": false}\n",
                "\n",
            ));
    });

    let mut runtime = runtime_against(&server, 5);
    runtime.start(request()).await.expect("job starts");

    wait_for(|| runtime.state().status == JobStatus::Failed).await;
    let state = runtime.state();
    assert!(!state.can_retry);
    let failure = state.error.expect("failure recorded");
    assert_eq!(failure.code, "VALIDATION_ERROR");

    let error = runtime.retry().await.expect_err("retry must be refused");
    assert!(matches!(error, JobError::InvalidTransition(_)));
}

#[tokio::test]
async fn invalid_request_never_reaches_the_network() {
    let server = MockServer::start();
    let start = mock_start_endpoint(&server);

    let mut runtime = runtime_against(&server, 5);
    let mut invalid = request();
    invalid.description = "abc".to_string();
    let error = runtime.start(invalid).await.expect_err("validation error");
    assert!(matches!(error, JobError::Validation(_)));
    assert_eq!(runtime.state().status, JobStatus::Idle);
    start.assert_calls(0);
}

#[tokio::test]
async fn canceling_mid_stream_lands_in_canceled_exactly_once() {
    let server = MockServer::start();
    mock_start_endpoint(&server);
    let cancel = server.mock(|when, then| {
        when.method(POST).path("/v1/generations/job-42/cancel");
        then.status(200).body("{}");
    });
    server.mock(|when, then| {
        when.method(GET).path("/v1/generations/job-42/stream");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                "event: progress\n",
                "data: {\"value\": 55, \"step_label\": \"Drafting act two\"}\n",
                "\n",
            ));
    });

    let mut runtime = runtime_against(&server, 5);
    runtime.start(request()).await.expect("job starts");
    wait_for(|| runtime.state().status == JobStatus::Streaming).await;

    runtime.cancel().await.expect("first cancel");
    runtime.cancel().await.expect("second cancel is a no-op");
    assert_eq!(runtime.state().status, JobStatus::Canceled);
    cancel.assert_calls(1);
}
