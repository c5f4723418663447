use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_BACKOFF_TABLE_MS: [u64; 4] = [1_000, 2_000, 5_000, 15_000];
pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_BREAKER_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: usize = 5;
pub const DEFAULT_BREAKER_COOLDOWN_MS: u64 = 30_000;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `ReconnectPolicyConfig` used across Quill components.
pub struct ReconnectPolicyConfig {
    pub backoff_table_ms: Vec<u64>,
    pub max_retries: usize,
    pub breaker_window_ms: u64,
    pub breaker_failure_threshold: usize,
    pub breaker_cooldown_ms: u64,
    pub jitter_enabled: bool,
}

impl Default for ReconnectPolicyConfig {
    fn default() -> Self {
        Self {
            backoff_table_ms: DEFAULT_BACKOFF_TABLE_MS.to_vec(),
            max_retries: DEFAULT_MAX_RETRIES,
            breaker_window_ms: DEFAULT_BREAKER_WINDOW_MS,
            breaker_failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_cooldown_ms: DEFAULT_BREAKER_COOLDOWN_MS,
            jitter_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `ReconnectAction` values.
pub enum ReconnectAction {
    Retry { delay_ms: u64 },
    Exhausted,
    CircuitOpen { cooldown_ms: u64 },
}

#[derive(Debug)]
/// Public struct `ReconnectPolicy` used across Quill components.
///
/// Decides what happens after a connection failure: retry with a jittered
/// delay from a fixed backoff table, give up until the user intervenes, or
/// open the circuit after repeated rapid failures.
pub struct ReconnectPolicy {
    config: ReconnectPolicyConfig,
    recent_failure_unix_ms: VecDeque<u64>,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectPolicyConfig) -> Self {
        Self {
            config,
            recent_failure_unix_ms: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &ReconnectPolicyConfig {
        &self.config
    }

    /// Records one failure into the rolling breaker window.
    pub fn record_failure(&mut self, now_unix_ms: u64) {
        self.recent_failure_unix_ms.push_back(now_unix_ms);
        self.prune_window(now_unix_ms);
    }

    /// Clears the rolling window and any breaker pressure. Invoked on a
    /// manual override, which always wins over automatic suppression.
    pub fn reset(&mut self) {
        self.recent_failure_unix_ms.clear();
    }

    pub fn failures_in_window(&self) -> usize {
        self.recent_failure_unix_ms.len()
    }

    /// Computes the next action for the given consecutive-failure count.
    ///
    /// Breaker pressure is evaluated first: once the rolling window reaches
    /// the threshold the answer is `CircuitOpen` and the window resets, so
    /// one storm opens the circuit exactly once.
    pub fn next_action(&mut self, retry_count: usize, now_unix_ms: u64) -> ReconnectAction {
        self.prune_window(now_unix_ms);
        if self.config.breaker_failure_threshold > 0
            && self.recent_failure_unix_ms.len() >= self.config.breaker_failure_threshold
        {
            self.recent_failure_unix_ms.clear();
            return ReconnectAction::CircuitOpen {
                cooldown_ms: self.config.breaker_cooldown_ms,
            };
        }

        if retry_count >= self.config.max_retries {
            return ReconnectAction::Exhausted;
        }

        ReconnectAction::Retry {
            delay_ms: self.backoff_delay_ms(retry_count),
        }
    }

    /// Returns the table delay for the attempt with jitter applied.
    pub fn backoff_delay_ms(&self, retry_count: usize) -> u64 {
        let table = &self.config.backoff_table_ms;
        if table.is_empty() {
            return 0;
        }
        let base = table[retry_count.min(table.len().saturating_sub(1))];
        jittered_delay_ms(base, self.config.jitter_enabled)
    }

    fn prune_window(&mut self, now_unix_ms: u64) {
        let cutoff = now_unix_ms.saturating_sub(self.config.breaker_window_ms);
        while let Some(oldest) = self.recent_failure_unix_ms.front() {
            if *oldest >= cutoff {
                break;
            }
            self.recent_failure_unix_ms.pop_front();
        }
    }
}

/// Applies bounded jitter in [90%, 110%] of the deterministic delay.
///
/// Uses a counter-mixed hash rather than a random source so retry spreading
/// needs no rand dependency and stays reproducible under test.
fn jittered_delay_ms(base_ms: u64, jitter_enabled: bool) -> u64 {
    if !jitter_enabled || base_ms < 10 {
        return base_ms;
    }

    let span = base_ms / 5;
    let low = base_ms.saturating_sub(base_ms / 10);
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    let jitter = if span == 0 {
        0
    } else {
        mixed % span.saturating_add(1)
    };
    low.saturating_add(jitter)
}
