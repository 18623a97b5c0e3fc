//! Sliding window arithmetic.

use std::time::Duration;

/// Capacity left in a window holding `current` live entries.
pub fn remaining_capacity(maximum_capacity: u64, current: u64) -> u64 {
    maximum_capacity.saturating_sub(current)
}

/// Liveness TTL in whole seconds for a window of the given length.
///
/// Rounded up so the stored set never expires before its newest entry.
pub fn ttl_seconds(window: Duration) -> u64 {
    let seconds = window.as_secs();
    let seconds = if window.subsec_nanos() > 0 {
        seconds + 1
    } else {
        seconds
    };
    seconds.max(1)
}
