/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when `deadline_unix_ms` is non-zero and no longer in the future.
///
/// A zero deadline means "not armed" and never reads as elapsed.
pub fn is_elapsed_unix_ms(deadline_unix_ms: u64, now_unix_ms: u64) -> bool {
    deadline_unix_ms > 0 && deadline_unix_ms <= now_unix_ms
}
