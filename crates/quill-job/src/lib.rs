//! Generation-job lifecycle: request validation, the job state machine fed
//! by stream events, the job-control HTTP client, and the runtime that owns
//! one job end to end.
mod generation_request;
mod job_control_api;
mod job_runtime;
mod job_state;

pub use generation_request::{
    GenerationRequest, ScriptType, DESCRIPTION_MAX_CHARS, DESCRIPTION_MIN_CHARS,
    TARGET_LENGTH_MAX_WORDS, TARGET_LENGTH_MIN_WORDS, TEMPERATURE_MAX, TEMPERATURE_MIN,
};
pub use job_control_api::{JobControlApi, JobControlApiConfig, JobControlClient, StartJobAccepted};
pub use job_runtime::{
    GenerationJobRuntime, GenerationJobRuntimeConfig, ERROR_CODE_START_FAILED,
};
pub use job_state::{JobError, JobFailure, JobState, JobStatus};

pub(crate) fn lock_or_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
