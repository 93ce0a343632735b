//! Wall-clock helpers, isolated so the queue's scheduling logic takes a
//! plain epoch-seconds integer rather than reaching for `SystemTime` itself.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
