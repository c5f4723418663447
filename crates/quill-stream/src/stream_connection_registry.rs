use std::collections::HashMap;
use std::sync::Mutex;

use quill_events::JobId;

type TeardownFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
/// Public struct `ConnectionRegistry` used across Quill components.
///
/// Explicit registry of open-connection teardowns, owned by the application
/// shell and injected where needed. Replaces ambient global tracking: on
/// navigation-style teardown the shell calls `cleanup_all` and every live
/// connection is closed.
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<JobId, TeardownFn>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a teardown for the job, replacing (and running) any
    /// teardown previously registered under the same id. One active
    /// connection per job id.
    pub fn register(&self, job_id: JobId, teardown: impl FnOnce() + Send + 'static) {
        let previous = {
            let mut entries = crate::lock_or_recover(&self.entries);
            entries.insert(job_id, Box::new(teardown))
        };
        if let Some(previous) = previous {
            previous();
        }
    }

    /// Removes the entry without running its teardown (connection closed on
    /// its own). Idempotent.
    pub fn unregister(&self, job_id: &JobId) {
        let mut entries = crate::lock_or_recover(&self.entries);
        entries.remove(job_id);
    }

    /// Tears down every registered connection.
    pub fn cleanup_all(&self) {
        let drained: Vec<TeardownFn> = {
            let mut entries = crate::lock_or_recover(&self.entries);
            entries.drain().map(|(_, teardown)| teardown).collect()
        };
        for teardown in drained {
            teardown();
        }
    }

    pub fn len(&self) -> usize {
        crate::lock_or_recover(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
