//! Wall-clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix epoch milliseconds.
///
/// A clock set before the epoch reads as zero.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
