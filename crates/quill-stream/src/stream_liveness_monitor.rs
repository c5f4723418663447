use std::time::Duration;

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Public struct `LivenessMonitorConfig` used across Quill components.
pub struct LivenessMonitorConfig {
    /// Silence budget before the connection is declared dead. The server
    /// heartbeat interval plus a grace margin.
    pub heartbeat_timeout: Duration,
    /// How often the deadline is evaluated.
    pub check_interval: Duration,
}

impl Default for LivenessMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            check_interval: DEFAULT_LIVENESS_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug)]
/// Public struct `LivenessMonitor` used across Quill components.
///
/// Tracks wall-clock recency of any inbound frame. Content-agnostic: a
/// heartbeat counts exactly as much as a progress frame. Raises at most one
/// timeout signal per arming; it must be reset before it can raise again.
pub struct LivenessMonitor {
    heartbeat_timeout_ms: u64,
    deadline_unix_ms: u64,
    raised: bool,
}

impl LivenessMonitor {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout_ms: u64::try_from(heartbeat_timeout.as_millis()).unwrap_or(u64::MAX),
            deadline_unix_ms: 0,
            raised: false,
        }
    }

    /// Arms the deadline from `now`. Also clears a previously raised signal;
    /// this is the explicit reset the raise-once contract requires.
    pub fn reset(&mut self, now_unix_ms: u64) {
        self.deadline_unix_ms = now_unix_ms.saturating_add(self.heartbeat_timeout_ms);
        self.raised = false;
    }

    /// Pushes the deadline forward on any received frame.
    pub fn record_frame(&mut self, now_unix_ms: u64) {
        self.deadline_unix_ms = now_unix_ms.saturating_add(self.heartbeat_timeout_ms);
    }

    /// Disarms the monitor entirely (connection torn down).
    pub fn disarm(&mut self) {
        self.deadline_unix_ms = 0;
        self.raised = false;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_unix_ms > 0
    }

    /// Returns true exactly once when the deadline has passed; stays quiet
    /// afterwards until `reset` re-arms it.
    pub fn check_timed_out(&mut self, now_unix_ms: u64) -> bool {
        if self.raised || !quill_core::is_elapsed_unix_ms(self.deadline_unix_ms, now_unix_ms) {
            return false;
        }
        self.raised = true;
        true
    }
}
