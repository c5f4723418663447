use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};

use quill_core::current_unix_timestamp_ms;
use quill_events::{decode_stream_frame, JobId, StreamEvent, StreamFrame, StreamFrameAssembler};

use crate::stream_connection_state::{
    ConnectionMetricsSnapshot, ConnectionSnapshot, ConnectionState, StreamClientError,
    StreamErrorNotice,
};
use crate::stream_liveness_monitor::{LivenessMonitor, LivenessMonitorConfig};
use crate::stream_reconnect_policy::{ReconnectAction, ReconnectPolicy, ReconnectPolicyConfig};

pub const RESUMPTION_TOKEN_QUERY_PARAM: &str = "last_event_id";
pub const ERROR_CODE_CONNECTION_EXHAUSTED: &str = "connection_exhausted";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

pub type StreamEventCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;
pub type ConnectionChangeCallback = Arc<dyn Fn(ConnectionSnapshot) + Send + Sync>;
pub type StreamErrorCallback = Arc<dyn Fn(StreamErrorNotice) + Send + Sync>;

#[derive(Clone, Default)]
/// Public struct `StreamEventHandlers` used across Quill components.
///
/// Capability set injected at construction. Every callback is optional; the
/// manager dispatches through whichever ones are present, so consumers wire
/// exactly the signals they care about and nothing happens implicitly.
pub struct StreamEventHandlers {
    pub on_event: Option<StreamEventCallback>,
    pub on_connection_change: Option<ConnectionChangeCallback>,
    pub on_error: Option<StreamErrorCallback>,
}

#[derive(Debug, Clone)]
/// Public struct `StreamConnectionConfig` used across Quill components.
pub struct StreamConnectionConfig {
    pub stream_url: String,
    pub connect_timeout: Duration,
    pub liveness: LivenessMonitorConfig,
    pub reconnect: ReconnectPolicyConfig,
}

impl StreamConnectionConfig {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            liveness: LivenessMonitorConfig::default(),
            reconnect: ReconnectPolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ManualRetryRequest {
    fresh: bool,
}

#[derive(Debug, Default)]
struct ShutdownSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn trigger(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
/// Public struct `ConnectionShutdownHandle` used across Quill components.
///
/// Synchronously triggerable teardown for one connection, suitable for a
/// `ConnectionRegistry` entry. Triggering is idempotent.
pub struct ConnectionShutdownHandle(Arc<ShutdownSignal>);

impl ConnectionShutdownHandle {
    pub fn trigger(&self) {
        self.0.trigger();
    }
}

#[derive(Debug)]
struct ConnectionTracker {
    state: ConnectionState,
    retry_count: usize,
    max_retries: usize,
    next_retry_in_seconds: Option<u64>,
    last_heartbeat_unix_ms: Option<u64>,
    last_error_message: Option<String>,
    resumption_token: Option<String>,
    metrics: ConnectionMetricsSnapshot,
}

impl ConnectionTracker {
    fn new(max_retries: usize) -> Self {
        Self {
            state: ConnectionState::Closed,
            retry_count: 0,
            max_retries,
            next_retry_in_seconds: None,
            last_heartbeat_unix_ms: None,
            last_error_message: None,
            resumption_token: None,
            metrics: ConnectionMetricsSnapshot::default(),
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            next_retry_in_seconds: self.next_retry_in_seconds,
            last_heartbeat_unix_ms: self.last_heartbeat_unix_ms,
            last_error_message: self.last_error_message.clone(),
        }
    }
}

/// Public struct `StreamConnectionManager` used across Quill components.
///
/// Owns the one live event-stream connection for a job id and the timers
/// around it. All connection state is written by the connection task or by
/// the manager's own methods after that task has been joined, so snapshots
/// never diverge from the internal counters.
pub struct StreamConnectionManager {
    job_id: JobId,
    config: StreamConnectionConfig,
    handlers: StreamEventHandlers,
    client: reqwest::Client,
    tracker: Arc<Mutex<ConnectionTracker>>,
    shutdown: Option<Arc<ShutdownSignal>>,
    manual_retry_tx: Option<mpsc::UnboundedSender<ManualRetryRequest>>,
    task: Option<JoinHandle<()>>,
}

impl StreamConnectionManager {
    pub fn new(
        job_id: JobId,
        config: StreamConnectionConfig,
        handlers: StreamEventHandlers,
    ) -> Result<Self, StreamClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        let tracker = Arc::new(Mutex::new(ConnectionTracker::new(
            config.reconnect.max_retries,
        )));
        Ok(Self {
            job_id,
            config,
            handlers,
            client,
            tracker,
            shutdown: None,
            manual_retry_tx: None,
            task: None,
        })
    }

    /// Opens the stream connection, tearing down a prior one for this job
    /// id first so at most one connection is ever live.
    pub async fn connect(&mut self) {
        self.shutdown_current_task().await;

        let shutdown = Arc::new(ShutdownSignal::default());
        let (manual_retry_tx, manual_retry_rx) = mpsc::unbounded_channel();
        let connection_loop = ConnectionLoop {
            job_id: self.job_id.clone(),
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            client: self.client.clone(),
            tracker: self.tracker.clone(),
            shutdown: shutdown.clone(),
            manual_retry_rx,
            policy: ReconnectPolicy::new(self.config.reconnect.clone()),
            retry_count: 0,
        };
        self.shutdown = Some(shutdown);
        self.manual_retry_tx = Some(manual_retry_tx);
        self.task = Some(tokio::spawn(connection_loop.run()));
    }

    /// Forces the connection to `Closed` from any state and cancels every
    /// pending reconnect, cooldown, and liveness timer. Idempotent; a
    /// disconnected job never silently reconnects.
    pub async fn disconnect(&mut self) {
        self.shutdown_current_task().await;
        update_tracker(&self.tracker, &self.handlers, |tracker| {
            tracker.state = ConnectionState::Closed;
            tracker.next_retry_in_seconds = None;
        });
    }

    /// Requests an immediate reconnect, overriding backoff, exhaustion, and
    /// an open circuit. `fresh` additionally drops the resumption token so
    /// the next attempt starts the stream from scratch. Returns false when
    /// no connection task is alive to honor the request.
    pub fn manual_retry(&self, fresh: bool) -> bool {
        match self.manual_retry_tx.as_ref() {
            Some(manual_retry_tx) => manual_retry_tx.send(ManualRetryRequest { fresh }).is_ok(),
            None => false,
        }
    }

    /// Handle for registry-driven teardown of the current connection task.
    pub fn shutdown_handle(&self) -> Option<ConnectionShutdownHandle> {
        self.shutdown
            .as_ref()
            .map(|signal| ConnectionShutdownHandle(signal.clone()))
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        crate::lock_or_recover(&self.tracker).snapshot()
    }

    pub fn metrics(&self) -> ConnectionMetricsSnapshot {
        crate::lock_or_recover(&self.tracker).metrics
    }

    pub fn resumption_token(&self) -> Option<String> {
        crate::lock_or_recover(&self.tracker).resumption_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    async fn shutdown_current_task(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.trigger();
        }
        self.manual_retry_tx = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

enum AttemptOutcome {
    Terminal,
    ShutdownRequested,
    Failed {
        error: StreamClientError,
        was_connected: bool,
    },
}

struct ConnectionLoop {
    job_id: JobId,
    config: StreamConnectionConfig,
    handlers: StreamEventHandlers,
    client: reqwest::Client,
    tracker: Arc<Mutex<ConnectionTracker>>,
    shutdown: Arc<ShutdownSignal>,
    manual_retry_rx: mpsc::UnboundedReceiver<ManualRetryRequest>,
    policy: ReconnectPolicy,
    retry_count: usize,
}

impl ConnectionLoop {
    async fn run(mut self) {
        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            let retry_count = self.retry_count;
            self.update_tracker(|tracker| {
                tracker.state = ConnectionState::Connecting;
                tracker.retry_count = retry_count;
                tracker.next_retry_in_seconds = None;
                tracker.metrics.attempts = tracker.metrics.attempts.saturating_add(1);
                if retry_count > 0 {
                    tracker.metrics.reconnects = tracker.metrics.reconnects.saturating_add(1);
                }
            });

            let error = match self.open_and_consume().await {
                AttemptOutcome::Terminal => {
                    self.update_tracker(|tracker| {
                        tracker.state = ConnectionState::Closed;
                        tracker.next_retry_in_seconds = None;
                    });
                    break;
                }
                AttemptOutcome::ShutdownRequested => break,
                AttemptOutcome::Failed {
                    error,
                    was_connected,
                } => {
                    if was_connected {
                        // The stream was open before it broke; backoff
                        // restarts from the first table entry.
                        self.retry_count = 0;
                    }
                    error
                }
            };

            tracing::debug!(
                job_id = %self.job_id,
                error = %error,
                "stream connection attempt failed"
            );

            let now_unix_ms = current_unix_timestamp_ms();
            self.policy.record_failure(now_unix_ms);
            let action = self.policy.next_action(self.retry_count, now_unix_ms);
            let message = error.to_string();

            match action {
                ReconnectAction::Retry { delay_ms } => {
                    self.retry_count = self.retry_count.saturating_add(1);
                    let retry_count = self.retry_count;
                    self.update_tracker(|tracker| {
                        tracker.state = ConnectionState::Retrying;
                        tracker.retry_count = retry_count;
                        tracker.next_retry_in_seconds = Some(whole_seconds(delay_ms));
                        tracker.last_error_message = Some(message.clone());
                    });
                    if !self.wait_for_delay_or_override(delay_ms).await {
                        break;
                    }
                }
                ReconnectAction::Exhausted => {
                    self.update_tracker(|tracker| {
                        tracker.state = ConnectionState::Closed;
                        tracker.next_retry_in_seconds = None;
                        tracker.last_error_message = Some(message.clone());
                    });
                    self.notify_error(
                        ERROR_CODE_CONNECTION_EXHAUSTED,
                        format!("connection lost and automatic retries are exhausted: {message}"),
                        true,
                    );
                    if !self.wait_for_manual_override().await {
                        break;
                    }
                }
                ReconnectAction::CircuitOpen { cooldown_ms } => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        cooldown_ms,
                        "circuit opened after repeated rapid stream failures"
                    );
                    self.update_tracker(|tracker| {
                        tracker.state = ConnectionState::CircuitOpen;
                        tracker.next_retry_in_seconds = Some(whole_seconds(cooldown_ms));
                        tracker.last_error_message = Some(message.clone());
                        tracker.metrics.breaker_opens =
                            tracker.metrics.breaker_opens.saturating_add(1);
                    });
                    if !self.wait_for_delay_or_override(cooldown_ms).await {
                        break;
                    }
                }
            }
        }

        self.update_tracker(|tracker| {
            tracker.state = ConnectionState::Closed;
            tracker.next_retry_in_seconds = None;
        });
    }

    /// Sleeps out a backoff or cooldown window. A manual override cuts the
    /// wait short. Returns false when the loop must stop.
    async fn wait_for_delay_or_override(&mut self, delay_ms: u64) -> bool {
        let mut stop = false;
        let mut override_request = None;
        {
            let shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.wait() => {
                    stop = true;
                }
                _ = sleep(Duration::from_millis(delay_ms)) => {}
                request = self.manual_retry_rx.recv() => match request {
                    Some(request) => override_request = Some(request),
                    None => stop = true,
                },
            }
        }
        if stop {
            return false;
        }
        if let Some(request) = override_request {
            self.apply_manual_override(request);
        }
        true
    }

    /// Parks the loop after exhaustion: only a manual override (or
    /// teardown) moves it again. Returns false when the loop must stop.
    async fn wait_for_manual_override(&mut self) -> bool {
        let mut override_request = None;
        {
            let shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.wait() => {}
                request = self.manual_retry_rx.recv() => override_request = request,
            }
        }
        match override_request {
            Some(request) => {
                self.apply_manual_override(request);
                true
            }
            None => false,
        }
    }

    fn apply_manual_override(&mut self, request: ManualRetryRequest) {
        tracing::debug!(
            job_id = %self.job_id,
            fresh = request.fresh,
            "manual retry override"
        );
        self.retry_count = 0;
        self.policy.reset();
        if request.fresh {
            crate::lock_or_recover(&self.tracker).resumption_token = None;
        }
    }

    async fn open_and_consume(&mut self) -> AttemptOutcome {
        let resumption_token = crate::lock_or_recover(&self.tracker).resumption_token.clone();
        let mut request = self
            .client
            .get(&self.config.stream_url)
            .header(ACCEPT, "text/event-stream")
            .header("x-quill-request-id", new_request_id())
            .header("x-quill-retry-attempt", self.retry_count.to_string());
        if let Some(token) = resumption_token.as_deref() {
            request = request.query(&[(RESUMPTION_TOKEN_QUERY_PARAM, token)]);
        }

        let shutdown = self.shutdown.clone();
        let send_result = tokio::select! {
            _ = shutdown.wait() => return AttemptOutcome::ShutdownRequested,
            result = tokio::time::timeout(self.config.connect_timeout, request.send()) => result,
        };
        let response = match send_result {
            Err(_) => {
                return AttemptOutcome::Failed {
                    error: StreamClientError::ConnectTimeout,
                    was_connected: false,
                }
            }
            Ok(Err(error)) => {
                return AttemptOutcome::Failed {
                    error: StreamClientError::Http(error),
                    was_connected: false,
                }
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return AttemptOutcome::Failed {
                error: StreamClientError::HttpStatus {
                    status: status.as_u16(),
                },
                was_connected: false,
            };
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.to_ascii_lowercase().contains("text/event-stream") {
            return AttemptOutcome::Failed {
                error: StreamClientError::UnexpectedContentType { content_type },
                was_connected: false,
            };
        }

        // Overrides queued before this connection opened are stale.
        while self.manual_retry_rx.try_recv().is_ok() {}
        self.retry_count = 0;
        self.update_tracker(|tracker| {
            tracker.state = ConnectionState::Connected;
            tracker.retry_count = 0;
            tracker.next_retry_in_seconds = None;
            tracker.last_error_message = None;
        });

        self.consume_stream(response).await
    }

    async fn consume_stream(&mut self, response: reqwest::Response) -> AttemptOutcome {
        let mut stream = response.bytes_stream();
        let mut assembler = StreamFrameAssembler::new();
        let mut liveness = LivenessMonitor::new(self.config.liveness.heartbeat_timeout);
        liveness.reset(current_unix_timestamp_ms());
        let mut check_interval = tokio::time::interval(self.config.liveness.check_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.wait() => return AttemptOutcome::ShutdownRequested,
                _ = check_interval.tick() => {
                    if liveness.check_timed_out(current_unix_timestamp_ms()) {
                        return AttemptOutcome::Failed {
                            error: StreamClientError::HeartbeatTimeout,
                            was_connected: true,
                        };
                    }
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in assembler.push_chunk(bytes.as_ref()) {
                            if self.process_frame(&mut liveness, &frame) {
                                return AttemptOutcome::Terminal;
                            }
                        }
                    }
                    Some(Err(error)) => {
                        return AttemptOutcome::Failed {
                            error: StreamClientError::Http(error),
                            was_connected: true,
                        };
                    }
                    None => {
                        if let Some(frame) = assembler.finish() {
                            if self.process_frame(&mut liveness, &frame) {
                                return AttemptOutcome::Terminal;
                            }
                        }
                        return AttemptOutcome::Failed {
                            error: StreamClientError::EndedEarly,
                            was_connected: true,
                        };
                    }
                }
            }
        }
    }

    /// Applies one assembled frame: liveness first, then decode and
    /// dispatch. Returns true when the frame carried a terminal event.
    fn process_frame(&self, liveness: &mut LivenessMonitor, frame: &StreamFrame) -> bool {
        let now_unix_ms = current_unix_timestamp_ms();
        liveness.record_frame(now_unix_ms);

        let Some(event) = decode_stream_frame(frame) else {
            self.update_tracker(|tracker| {
                tracker.metrics.frames_received = tracker.metrics.frames_received.saturating_add(1);
                tracker.metrics.frames_discarded =
                    tracker.metrics.frames_discarded.saturating_add(1);
            });
            tracing::debug!(
                job_id = %self.job_id,
                event = frame.event.as_deref().unwrap_or_default(),
                "discarded malformed stream frame"
            );
            return false;
        };

        let terminal = event.is_terminal();
        let heartbeat = matches!(event, StreamEvent::Heartbeat { .. });
        self.update_tracker(|tracker| {
            tracker.metrics.frames_received = tracker.metrics.frames_received.saturating_add(1);
            tracker.metrics.events_dispatched = tracker.metrics.events_dispatched.saturating_add(1);
            if let Some(id) = frame.id.as_deref() {
                tracker.resumption_token = Some(id.to_string());
            }
            if heartbeat {
                tracker.last_heartbeat_unix_ms = Some(now_unix_ms);
            }
        });

        if let Some(on_event) = self.handlers.on_event.as_ref() {
            on_event(event);
        }
        terminal
    }

    fn update_tracker(&self, mutate: impl FnOnce(&mut ConnectionTracker)) {
        update_tracker(&self.tracker, &self.handlers, mutate);
    }

    fn notify_error(&self, code: &str, message: String, retryable: bool) {
        if let Some(on_error) = self.handlers.on_error.as_ref() {
            on_error(StreamErrorNotice {
                code: code.to_string(),
                message,
                retryable,
            });
        }
    }
}

/// Mutates the tracker and notifies the change handler when the derived
/// snapshot actually changed. Metric-only updates stay quiet.
fn update_tracker(
    tracker: &Arc<Mutex<ConnectionTracker>>,
    handlers: &StreamEventHandlers,
    mutate: impl FnOnce(&mut ConnectionTracker),
) {
    let (before, after) = {
        let mut guard = crate::lock_or_recover(tracker);
        let before = guard.snapshot();
        mutate(&mut guard);
        (before, guard.snapshot())
    };
    if before != after {
        if let Some(on_connection_change) = handlers.on_connection_change.as_ref() {
            on_connection_change(after);
        }
    }
}

fn whole_seconds(delay_ms: u64) -> u64 {
    delay_ms.saturating_add(999) / 1_000
}

fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("quill-{millis}-{count}")
}
