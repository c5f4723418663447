use std::sync::{Arc, Mutex};
use std::time::Duration;

use quill_events::JobId;
use quill_stream::{
    ConnectionMetricsSnapshot, ConnectionRegistry, LivenessMonitorConfig, ReconnectPolicyConfig,
    StreamConnectionConfig, StreamConnectionManager, StreamErrorNotice, StreamEventHandlers,
};

use crate::generation_request::GenerationRequest;
use crate::job_control_api::JobControlClient;
use crate::job_state::{JobError, JobState};

pub const ERROR_CODE_START_FAILED: &str = "start_failed";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
/// Public struct `GenerationJobRuntimeConfig` used across Quill components.
pub struct GenerationJobRuntimeConfig {
    pub connect_timeout: Duration,
    pub liveness: LivenessMonitorConfig,
    pub reconnect: ReconnectPolicyConfig,
}

impl Default for GenerationJobRuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            liveness: LivenessMonitorConfig::default(),
            reconnect: ReconnectPolicyConfig::default(),
        }
    }
}

/// Public struct `GenerationJobRuntime` used across Quill components.
///
/// Owns one generation job end to end: validates the request, starts it
/// through the job-control collaborator, wires the stream connection into
/// the job state machine, and exposes the user actions (start, cancel,
/// retry, reset) plus read-only state snapshots.
pub struct GenerationJobRuntime {
    config: GenerationJobRuntimeConfig,
    control: Arc<dyn JobControlClient>,
    registry: Arc<ConnectionRegistry>,
    state: Arc<Mutex<JobState>>,
    manager: Option<StreamConnectionManager>,
    job_id: Option<JobId>,
    cancel_url: Option<String>,
    last_request: Option<GenerationRequest>,
}

impl GenerationJobRuntime {
    pub fn new(
        config: GenerationJobRuntimeConfig,
        control: Arc<dyn JobControlClient>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            config,
            control,
            registry,
            state: Arc::new(Mutex::new(JobState::default())),
            manager: None,
            job_id: None,
            cancel_url: None,
            last_request: None,
        }
    }

    /// Starts a new generation. Valid from the initial shape or a terminal
    /// state; an active job must be canceled or reset first. The request is
    /// validated before any network activity.
    pub async fn start(&mut self, request: GenerationRequest) -> Result<JobId, JobError> {
        {
            let state = crate::lock_or_recover(&self.state);
            if state.status.is_active() {
                return Err(JobError::InvalidTransition(format!(
                    "cannot start while a job is {}; cancel or reset first",
                    state.status.as_str()
                )));
            }
        }
        request.validate()?;
        self.teardown_connection().await;

        *crate::lock_or_recover(&self.state) =
            JobState::queued(self.config.reconnect.max_retries);
        self.job_id = None;
        self.cancel_url = None;
        self.last_request = Some(request.clone());

        let accepted = match self.control.start_job(&request).await {
            Ok(accepted) => accepted,
            Err(error) => {
                crate::lock_or_recover(&self.state).apply_connection_error(StreamErrorNotice {
                    code: ERROR_CODE_START_FAILED.to_string(),
                    message: error.to_string(),
                    retryable: true,
                });
                return Err(error);
            }
        };

        tracing::debug!(
            job_id = %accepted.job_id,
            stream_url = accepted.stream_url.as_str(),
            "generation job accepted"
        );
        self.job_id = Some(accepted.job_id.clone());
        self.cancel_url = Some(accepted.cancel_url.clone());

        let stream_config = StreamConnectionConfig {
            stream_url: accepted.stream_url.clone(),
            connect_timeout: self.config.connect_timeout,
            liveness: self.config.liveness,
            reconnect: self.config.reconnect.clone(),
        };
        let mut manager = StreamConnectionManager::new(
            accepted.job_id.clone(),
            stream_config,
            self.build_handlers(),
        )?;
        manager.connect().await;
        if let Some(handle) = manager.shutdown_handle() {
            self.registry
                .register(accepted.job_id.clone(), move || handle.trigger());
        }
        self.manager = Some(manager);
        Ok(accepted.job_id)
    }

    /// Optimistic cancellation: fires the idempotent remote cancel, logs
    /// (never propagates) bookkeeping failures, tears the connection down,
    /// and transitions to `Canceled`. A no-op unless the job is active, so
    /// repeated calls produce exactly one remote side effect.
    pub async fn cancel(&mut self) -> Result<(), JobError> {
        if !self.state().status.is_active() {
            return Ok(());
        }
        if let (Some(cancel_url), Some(job_id)) = (self.cancel_url.clone(), self.job_id.clone()) {
            if let Err(error) = self.control.cancel_job(&cancel_url, &job_id).await {
                tracing::warn!(
                    job_id = %job_id,
                    error = %error,
                    "cancel bookkeeping failed; canceling locally anyway"
                );
            }
        }
        self.teardown_connection().await;
        crate::lock_or_recover(&self.state).mark_canceled();
        Ok(())
    }

    /// Generates again with the same parameters through a fresh `start`.
    /// Only valid when the current state offers a retry.
    pub async fn retry(&mut self) -> Result<JobId, JobError> {
        if !self.state().can_retry {
            return Err(JobError::InvalidTransition(
                "retry is not available for this job".to_string(),
            ));
        }
        let request = self.last_request.clone().ok_or_else(|| {
            JobError::InvalidTransition("no previous request to retry".to_string())
        })?;
        self.start(request).await
    }

    /// Returns to the initial pre-queued shape and tears down any
    /// connection. Safe from any state.
    pub async fn reset(&mut self) {
        self.teardown_connection().await;
        *crate::lock_or_recover(&self.state) = JobState::default();
        self.job_id = None;
        self.cancel_url = None;
        self.last_request = None;
    }

    /// Immediate reconnect of the underlying stream, overriding backoff and
    /// the circuit breaker. `fresh` drops the resumption token first.
    pub fn retry_connection(&self, fresh: bool) -> bool {
        match self.manager.as_ref() {
            Some(manager) => manager.manual_retry(fresh),
            None => false,
        }
    }

    /// Read-only snapshot of the aggregate.
    pub fn state(&self) -> JobState {
        crate::lock_or_recover(&self.state).clone()
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn progress_message(&self) -> String {
        self.state().progress_message()
    }

    pub fn eta_message(&self) -> Option<String> {
        self.state().eta_message()
    }

    pub fn connection_metrics(&self) -> Option<ConnectionMetricsSnapshot> {
        self.manager.as_ref().map(StreamConnectionManager::metrics)
    }

    fn build_handlers(&self) -> StreamEventHandlers {
        let event_state = self.state.clone();
        let change_state = self.state.clone();
        let error_state = self.state.clone();
        StreamEventHandlers {
            on_event: Some(Arc::new(move |event| {
                crate::lock_or_recover(&event_state).apply_stream_event(event);
            })),
            on_connection_change: Some(Arc::new(move |snapshot| {
                crate::lock_or_recover(&change_state).apply_connection_change(snapshot);
            })),
            on_error: Some(Arc::new(move |notice| {
                crate::lock_or_recover(&error_state).apply_connection_error(notice);
            })),
        }
    }

    async fn teardown_connection(&mut self) {
        if let Some(mut manager) = self.manager.take() {
            self.registry.unregister(manager.job_id());
            manager.disconnect().await;
        }
    }
}
