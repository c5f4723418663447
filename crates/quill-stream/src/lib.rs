//! Resilient streaming-connection layer for generation jobs.
//!
//! Owns the one live server-push connection per job id, turns raw transport
//! chunks into typed events, detects silent connections through heartbeat
//! liveness, and recovers from transient failures with jittered backoff and
//! a circuit breaker.
mod stream_connection_manager;
mod stream_connection_registry;
mod stream_connection_state;
mod stream_liveness_monitor;
mod stream_reconnect_policy;

pub use stream_connection_manager::{
    ConnectionChangeCallback, ConnectionShutdownHandle, StreamConnectionConfig,
    StreamConnectionManager, StreamErrorCallback, StreamEventCallback, StreamEventHandlers,
    ERROR_CODE_CONNECTION_EXHAUSTED, RESUMPTION_TOKEN_QUERY_PARAM,
};
pub use stream_connection_registry::ConnectionRegistry;
pub use stream_connection_state::{
    ConnectionMetricsSnapshot, ConnectionSnapshot, ConnectionState, StreamClientError,
    StreamErrorNotice,
};
pub use stream_liveness_monitor::{LivenessMonitor, LivenessMonitorConfig};
pub use stream_reconnect_policy::{ReconnectAction, ReconnectPolicy, ReconnectPolicyConfig};

pub(crate) fn lock_or_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
