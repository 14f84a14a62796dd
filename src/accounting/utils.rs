use std::time::{SystemTime, UNIX_EPOCH};

/// Type alias for standard timestamps (seconds since UNIX epoch)
pub type Timestamp = u64;

/// Returns the current time as a `Timestamp`.
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
