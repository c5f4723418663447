use std::fmt;

use serde::{Deserialize, Serialize};

pub const PROGRESS_VALUE_MAX: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Public struct `JobId` used across Quill components.
///
/// Opaque identifier of one generation task. Stable for the task's entire
/// lifetime; keys the circuit breaker, liveness timer, and registry entry.
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Enumerates supported `StreamEvent` values.
///
/// One decoded frame from the generation event stream. Immutable once
/// constructed; the codec produces at most one per inbound frame.
pub enum StreamEvent {
    Progress {
        value: u8,
        step_label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_remaining_seconds: Option<u64>,
    },
    Preview {
        content_fragment: String,
        is_partial: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        word_count: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_tokens: Option<u64>,
    },
    Completed {
        final_content: String,
        token_count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        word_count: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_used: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        saved_resource_id: Option<String>,
    },
    Failed {
        error_code: String,
        error_message: String,
        retryable: bool,
    },
    Heartbeat {
        server_timestamp_unix_ms: u64,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> StreamEventKind {
        match self {
            Self::Progress { .. } => StreamEventKind::Progress,
            Self::Preview { .. } => StreamEventKind::Preview,
            Self::Completed { .. } => StreamEventKind::Completed,
            Self::Failed { .. } => StreamEventKind::Failed,
            Self::Heartbeat { .. } => StreamEventKind::Heartbeat,
        }
    }

    /// True for events that end the job (`Completed`, `Failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `StreamEventKind` values.
pub enum StreamEventKind {
    Progress,
    Preview,
    Completed,
    Failed,
    Heartbeat,
}

impl StreamEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Preview => "preview",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "progress" => Some(Self::Progress),
            "preview" => Some(Self::Preview),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}
