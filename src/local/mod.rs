//! In-process rate limiters.
//!
//! Each limiter owns the state for exactly one key behind a single mutex.
//! The lock is held only for in-memory arithmetic, never while waiting.

mod leaky_bucket;
mod sliding_window;
mod wait;

use std::time::Duration;

pub use leaky_bucket::LocalLeakyBucket;
pub use sliding_window::LocalSlidingWindow;

/// A limiter that can be polled for a single token.
///
/// This is the seam the blocking layer is built on: every wait function
/// loops over [`LocalLimiter::try_take_with_duration`].
pub trait LocalLimiter: Send + Sync {
    /// Attempt to take one token.
    ///
    /// Returns `(true, Duration::ZERO)` on success, or `(false, retry_in)`
    /// where `retry_in` is the time until the next token may be available.
    fn try_take_with_duration(&self) -> (bool, Duration);

    /// Attempt to take one token.
    fn try_take(&self) -> bool {
        self.try_take_with_duration().0
    }
}
