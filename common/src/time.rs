// Time types used across the project.
//
// SystemTime::now() is non-deterministic and must never be observed from
// contract code. The mining loop reads the clock once per tick and derives
// every chain-visible timestamp from the tip (max(now, prev_ts + 1)), so a
// jumping clock can never produce a non-monotonic chain.

use std::time::{SystemTime, UNIX_EPOCH};

// Millisecond timestamps, signed to match the store's bigint columns
pub type TimestampMillis = i64;

// Return the current wall clock in milliseconds since the unix epoch
pub fn current_time_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMillis)
        .unwrap_or(0)
}
