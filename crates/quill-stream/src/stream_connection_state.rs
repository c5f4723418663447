use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ConnectionState` values.
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Retrying,
    CircuitOpen,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
            Self::CircuitOpen => "circuit_open",
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `ConnectionSnapshot` used across Quill components.
///
/// Derived view of the connection manager's internal counters, recomputed
/// on every transition by the single writer. Consumers never mutate it.
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub retry_count: usize,
    pub max_retries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_in_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_unix_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
}

impl ConnectionSnapshot {
    pub fn closed(max_retries: usize) -> Self {
        Self {
            state: ConnectionState::Closed,
            retry_count: 0,
            max_retries,
            next_retry_in_seconds: None,
            last_heartbeat_unix_ms: None,
            last_error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `ConnectionMetricsSnapshot` used across Quill components.
///
/// Monotonic counters for logging and metrics; never reset for the lifetime
/// of one manager.
pub struct ConnectionMetricsSnapshot {
    pub attempts: u64,
    pub frames_received: u64,
    pub frames_discarded: u64,
    pub events_dispatched: u64,
    pub reconnects: u64,
    pub breaker_opens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `StreamErrorNotice` used across Quill components.
///
/// User-facing failure surfaced through the error handler once automatic
/// recovery has stopped. `retryable` decides whether a manual retry
/// affordance is shown.
pub struct StreamErrorNotice {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Error)]
/// Enumerates supported `StreamClientError` values.
pub enum StreamClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stream endpoint returned non-success status {status}")]
    HttpStatus { status: u16 },
    #[error("stream endpoint returned content type {content_type:?}, expected text/event-stream")]
    UnexpectedContentType { content_type: String },
    #[error("stream connect attempt timed out")]
    ConnectTimeout,
    #[error("stream ended before a terminal event")]
    EndedEarly,
    #[error("no frame received within the liveness window")]
    HeartbeatTimeout,
}

#[cfg(test)]
mod tests {
    use super::{ConnectionSnapshot, ConnectionState};

    #[test]
    fn connection_state_labels_are_stable() {
        assert_eq!(ConnectionState::Closed.as_str(), "closed");
        assert_eq!(ConnectionState::CircuitOpen.as_str(), "circuit_open");
        assert!(ConnectionState::Closed.is_closed());
        assert!(!ConnectionState::Retrying.is_closed());
    }

    #[test]
    fn closed_snapshot_is_the_neutral_shape() {
        let snapshot = ConnectionSnapshot::closed(5);
        assert_eq!(snapshot.state, ConnectionState::Closed);
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.max_retries, 5);
        assert!(snapshot.last_error_message.is_none());
    }
}
