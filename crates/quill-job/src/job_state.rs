use serde::{Deserialize, Serialize};
use thiserror::Error;

use quill_events::StreamEvent;
use quill_stream::{ConnectionSnapshot, StreamClientError, StreamErrorNotice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `JobStatus` values.
///
/// `Completed`, `Failed`, and `Canceled` are absorbing: once reached, no
/// stream event moves the job again. Only `reset` or a fresh `start` does.
pub enum JobStatus {
    Idle,
    Queued,
    Streaming,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `JobFailure` used across Quill components.
pub struct JobFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Error)]
/// Enumerates supported `JobError` values.
pub enum JobError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("job control returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("stream client error: {0}")]
    Stream(#[from] StreamClientError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Public struct `JobState` used across Quill components.
///
/// The externally visible aggregate for one generation job, advanced only
/// by validated stream events and explicit user actions. Consumers read
/// snapshots; they never mutate.
pub struct JobState {
    pub status: JobStatus,
    pub progress: u8,
    pub current_step_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<u64>,
    pub preview_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    pub token_count: u64,
    pub word_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_resource_id: Option<String>,
    pub connection: ConnectionSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub can_retry: bool,
    pub can_save: bool,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            status: JobStatus::Idle,
            progress: 0,
            current_step_label: String::new(),
            estimated_remaining_seconds: None,
            preview_content: String::new(),
            final_content: None,
            token_count: 0,
            word_count: 0,
            model_used: None,
            saved_resource_id: None,
            connection: ConnectionSnapshot::closed(0),
            error: None,
            can_retry: false,
            can_save: false,
        }
    }
}

impl JobState {
    /// Fresh aggregate for a newly accepted job.
    pub fn queued(max_retries: usize) -> Self {
        Self {
            status: JobStatus::Queued,
            connection: ConnectionSnapshot::closed(max_retries),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merges one validated stream event. Events arriving after a terminal
    /// state are discarded and logged at debug level, never surfaced as a
    /// second transition.
    pub fn apply_stream_event(&mut self, event: StreamEvent) {
        if self.is_terminal() {
            tracing::debug!(
                status = self.status.as_str(),
                event = event.kind().as_str(),
                "discarded stream event after terminal state"
            );
            return;
        }

        match event {
            StreamEvent::Progress {
                value,
                step_label,
                estimated_remaining_seconds,
            } => {
                self.mark_streaming();
                // Latest wins; values are never accumulated or averaged.
                self.progress = value;
                self.current_step_label = step_label;
                self.estimated_remaining_seconds = estimated_remaining_seconds;
            }
            StreamEvent::Preview {
                content_fragment,
                is_partial,
                word_count,
                estimated_tokens,
            } => {
                self.mark_streaming();
                if is_partial {
                    self.preview_content.push_str(&content_fragment);
                } else {
                    self.preview_content = content_fragment;
                }
                if let Some(word_count) = word_count {
                    self.word_count = word_count;
                }
                if let Some(estimated_tokens) = estimated_tokens {
                    self.token_count = estimated_tokens;
                }
            }
            StreamEvent::Completed {
                final_content,
                token_count,
                word_count,
                model_used,
                saved_resource_id,
            } => {
                self.status = JobStatus::Completed;
                self.progress = 100;
                self.preview_content = final_content.clone();
                self.final_content = Some(final_content);
                self.token_count = token_count;
                if let Some(word_count) = word_count {
                    self.word_count = word_count;
                }
                self.model_used = model_used;
                self.saved_resource_id = saved_resource_id;
                self.estimated_remaining_seconds = None;
                self.error = None;
                self.can_save = true;
                self.can_retry = true;
            }
            StreamEvent::Failed {
                error_code,
                error_message,
                retryable,
            } => {
                self.status = JobStatus::Failed;
                self.estimated_remaining_seconds = None;
                self.can_save = false;
                self.can_retry = retryable;
                self.error = Some(JobFailure {
                    code: error_code,
                    message: error_message,
                    retryable,
                });
            }
            // Heartbeats keep the connection alive; the job itself does not
            // move.
            StreamEvent::Heartbeat { .. } => {}
        }
    }

    /// Mirrors the connection manager's derived status into the aggregate.
    pub fn apply_connection_change(&mut self, snapshot: ConnectionSnapshot) {
        self.connection = snapshot;
    }

    /// Records a connection-level failure surfaced after automatic recovery
    /// stopped. The job parks in `Failed` with a manual-retry affordance
    /// when the notice says so.
    pub fn apply_connection_error(&mut self, notice: StreamErrorNotice) {
        if self.is_terminal() {
            tracing::debug!(
                status = self.status.as_str(),
                code = notice.code.as_str(),
                "discarded connection error after terminal state"
            );
            return;
        }
        self.status = JobStatus::Failed;
        self.estimated_remaining_seconds = None;
        self.can_save = false;
        self.can_retry = notice.retryable;
        self.error = Some(JobFailure {
            code: notice.code,
            message: notice.message,
            retryable: notice.retryable,
        });
    }

    /// Optimistic local cancellation; a no-op from a terminal state.
    pub fn mark_canceled(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Canceled;
        self.estimated_remaining_seconds = None;
        self.can_save = false;
        self.can_retry = false;
    }

    /// Human-readable one-liner for the current lifecycle position.
    pub fn progress_message(&self) -> String {
        match self.status {
            JobStatus::Idle => "Not started".to_string(),
            JobStatus::Queued => "Waiting for the generation to begin".to_string(),
            JobStatus::Streaming => {
                if self.current_step_label.is_empty() {
                    format!("Generating ({}%)", self.progress)
                } else {
                    format!("{} ({}%)", self.current_step_label, self.progress)
                }
            }
            JobStatus::Completed => "Generation complete".to_string(),
            JobStatus::Failed => match self.error.as_ref() {
                Some(failure) => format!("Generation failed: {}", failure.message),
                None => "Generation failed".to_string(),
            },
            JobStatus::Canceled => "Generation canceled".to_string(),
        }
    }

    /// Estimated-time-remaining string, present only while one is known.
    pub fn eta_message(&self) -> Option<String> {
        if self.status != JobStatus::Streaming {
            return None;
        }
        let seconds = self.estimated_remaining_seconds?;
        if seconds < 60 {
            return Some(format!("about {seconds}s remaining"));
        }
        let minutes = seconds.saturating_add(30) / 60;
        Some(format!("about {minutes} min remaining"))
    }

    fn mark_streaming(&mut self) {
        if self.status == JobStatus::Queued {
            self.status = JobStatus::Streaming;
        }
    }
}

#[cfg(test)]
mod tests {
    use quill_events::StreamEvent;
    use quill_stream::StreamErrorNotice;

    use super::{JobState, JobStatus};

    fn progress(value: u8, step_label: &str) -> StreamEvent {
        StreamEvent::Progress {
            value,
            step_label: step_label.to_string(),
            estimated_remaining_seconds: None,
        }
    }

    fn completed(final_content: &str) -> StreamEvent {
        StreamEvent::Completed {
            final_content: final_content.to_string(),
            token_count: 42,
            word_count: Some(30),
            model_used: Some("quill-large".to_string()),
            saved_resource_id: None,
        }
    }

    #[test]
    fn unit_first_progress_moves_queued_to_streaming_with_latest_value() {
        let mut state = JobState::queued(5);
        state.apply_stream_event(progress(10, "outline"));
        assert_eq!(state.status, JobStatus::Streaming);
        assert_eq!(state.progress, 10);

        state.apply_stream_event(progress(40, "draft"));
        state.apply_stream_event(progress(35, "draft"));
        // Latest wins, even when the server re-sends a lower value.
        assert_eq!(state.progress, 35);
        assert_eq!(state.current_step_label, "draft");
    }

    #[test]
    fn unit_preview_appends_partials_and_replaces_snapshots() {
        let mut state = JobState::queued(5);
        state.apply_stream_event(StreamEvent::Preview {
            content_fragment: "INT. LAB".to_string(),
            is_partial: true,
            word_count: Some(2),
            estimated_tokens: Some(4),
        });
        state.apply_stream_event(StreamEvent::Preview {
            content_fragment: " - NIGHT".to_string(),
            is_partial: true,
            word_count: Some(4),
            estimated_tokens: None,
        });
        assert_eq!(state.preview_content, "INT. LAB - NIGHT");
        assert_eq!(state.word_count, 4);
        assert_eq!(state.token_count, 4);

        state.apply_stream_event(StreamEvent::Preview {
            content_fragment: "FADE IN".to_string(),
            is_partial: false,
            word_count: None,
            estimated_tokens: None,
        });
        assert_eq!(state.preview_content, "FADE IN");
    }

    #[test]
    fn functional_completed_freezes_the_aggregate() {
        let mut state = JobState::queued(5);
        state.apply_stream_event(progress(80, "polish"));
        state.apply_stream_event(completed("THE END"));

        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(state.final_content.as_deref(), Some("THE END"));
        assert_eq!(state.preview_content, "THE END");
        assert_eq!(state.token_count, 42);
        assert!(state.can_save);
        assert!(state.can_retry);

        // Terminal state absorbs everything that arrives late.
        state.apply_stream_event(progress(10, "stale"));
        state.apply_stream_event(StreamEvent::Failed {
            error_code: "LATE".to_string(),
            error_message: "late duplicate".to_string(),
            retryable: true,
        });
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(state.preview_content, "THE END");
        assert!(state.error.is_none());
    }

    #[test]
    fn functional_server_failure_is_authoritative() {
        let mut state = JobState::queued(5);
        state.apply_stream_event(progress(50, "draft"));
        state.apply_stream_event(StreamEvent::Failed {
            error_code: "VALIDATION_ERROR".to_string(),
            error_message: "prompt rejected".to_string(),
            retryable: false,
        });
        assert_eq!(state.status, JobStatus::Failed);
        assert!(!state.can_retry);
        assert!(!state.can_save);
        let failure = state.error.as_ref().expect("failure recorded");
        assert_eq!(failure.code, "VALIDATION_ERROR");
    }

    #[test]
    fn unit_heartbeat_is_inert_to_job_state() {
        let mut state = JobState::queued(5);
        state.apply_stream_event(StreamEvent::Heartbeat {
            server_timestamp_unix_ms: 99,
        });
        assert_eq!(state.status, JobStatus::Queued);
        assert_eq!(state.progress, 0);
    }

    #[test]
    fn functional_connection_error_parks_the_job_as_retryable_failure() {
        let mut state = JobState::queued(5);
        state.apply_stream_event(progress(20, "outline"));
        state.apply_connection_error(StreamErrorNotice {
            code: "connection_exhausted".to_string(),
            message: "connection lost".to_string(),
            retryable: true,
        });
        assert_eq!(state.status, JobStatus::Failed);
        assert!(state.can_retry);

        // A late notice after completion would be discarded instead.
        let mut completed_state = JobState::queued(5);
        completed_state.apply_stream_event(completed("DONE"));
        completed_state.apply_connection_error(StreamErrorNotice {
            code: "connection_exhausted".to_string(),
            message: "stale".to_string(),
            retryable: true,
        });
        assert_eq!(completed_state.status, JobStatus::Completed);
    }

    #[test]
    fn unit_cancel_is_absorbing_and_idempotent() {
        let mut state = JobState::queued(5);
        state.mark_canceled();
        assert_eq!(state.status, JobStatus::Canceled);
        state.apply_stream_event(progress(90, "late"));
        assert_eq!(state.progress, 0);

        let mut completed_state = JobState::queued(5);
        completed_state.apply_stream_event(completed("DONE"));
        completed_state.mark_canceled();
        assert_eq!(completed_state.status, JobStatus::Completed);
    }

    #[test]
    fn unit_derived_strings_reflect_the_lifecycle() {
        let mut state = JobState::queued(5);
        assert_eq!(
            state.progress_message(),
            "Waiting for the generation to begin"
        );
        assert_eq!(state.eta_message(), None);

        state.apply_stream_event(StreamEvent::Progress {
            value: 40,
            step_label: "Drafting act two".to_string(),
            estimated_remaining_seconds: Some(95),
        });
        assert_eq!(state.progress_message(), "Drafting act two (40%)");
        assert_eq!(state.eta_message().as_deref(), Some("about 2 min remaining"));

        state.apply_stream_event(StreamEvent::Progress {
            value: 90,
            step_label: "Polish".to_string(),
            estimated_remaining_seconds: Some(20),
        });
        assert_eq!(state.eta_message().as_deref(), Some("about 20s remaining"));
    }
}
