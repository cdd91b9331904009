//! Wall-clock helpers. Session close timestamps are informational only,
//! eviction order is insertion order, not timestamp order.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_secs()
}

/// Current time as Unix milliseconds, matching the source's `closeSession`
/// timestamp granularity.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_millis() as i64
}
