//! Store-backed sliding window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::scripts;
use crate::clock::{Clock, SystemClock};
use crate::config::SlidingWindowOptions;
use crate::error::{RateLimitError, Result};
use crate::ratelimit::sliding_window::{remaining_capacity, ttl_seconds};
use crate::store::{ScriptArg, ScriptExecutor};

/// Response of [`DistributedSlidingWindow::take`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseSlidingWindowResponse {
    /// Whether a token was taken
    pub success: bool,
    /// Tokens that could still be taken
    pub remaining_capacity: u64,
}

/// Response of [`DistributedSlidingWindow::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectSlidingWindowResponse {
    /// Tokens that could still be taken
    pub remaining_capacity: u64,
}

/// A sliding window whose state lives in a shared store.
///
/// The store keeps one sorted-set member per live token, scored by its
/// expiry in nanoseconds. Expired members are evicted at the start of every
/// call, and at most `maximum_capacity` members may be live. Each call is a
/// single script execution.
#[derive(Debug)]
pub struct DistributedSlidingWindow<E> {
    executor: E,
    clock: Arc<dyn Clock>,
}

impl<E: ScriptExecutor> DistributedSlidingWindow<E> {
    /// Create a window client using the system clock.
    pub fn new(executor: E) -> Self {
        Self::with_clock(executor, Arc::new(SystemClock))
    }

    /// Create a window client reading time from `clock`.
    pub fn with_clock(executor: E, clock: Arc<dyn Clock>) -> Self {
        Self { executor, clock }
    }

    /// The underlying script executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Report the window's remaining capacity without taking a token.
    pub async fn inspect(
        &self,
        bucket: &SlidingWindowOptions,
    ) -> Result<InspectSlidingWindowResponse> {
        const OPERATION: &str = "sliding window inspect";

        bucket.validate()?;
        let now = self.now_nanos()?;

        let reply = self
            .executor
            .eval(
                &scripts::SLIDING_WINDOW_INSPECT,
                &[bucket.key.clone()],
                &[ScriptArg::from(now)],
            )
            .await
            .map_err(|e| RateLimitError::backend(OPERATION, e))?;

        let count = reply
            .into_int()
            .map_err(|e| RateLimitError::parse(OPERATION, e))?;

        Ok(InspectSlidingWindowResponse {
            remaining_capacity: remaining_capacity(bucket.maximum_capacity, count.max(0) as u64),
        })
    }

    /// Atomically try to take one token from the window.
    ///
    /// A rejection is reported with `success == false`, not as an error.
    pub async fn take(&self, bucket: &SlidingWindowOptions) -> Result<UseSlidingWindowResponse> {
        const OPERATION: &str = "sliding window use";

        bucket.validate()?;
        let now = self.now_nanos()?;
        let window =
            i64::try_from(bucket.window.as_nanos()).map_err(|_| RateLimitError::InvalidDuration)?;
        let expires_at = now
            .checked_add(window)
            .ok_or(RateLimitError::TimestampOutOfRange(now))?;

        trace!(window = %bucket.key, "Checking sliding window");

        let args = [
            ScriptArg::from(now),
            ScriptArg::from(expires_at),
            ScriptArg::from(ttl_seconds(bucket.window)),
            ScriptArg::from(bucket.maximum_capacity),
        ];

        let reply = self
            .executor
            .eval(&scripts::SLIDING_WINDOW_USE, &[bucket.key.clone()], &args)
            .await
            .map_err(|e| RateLimitError::backend(OPERATION, e))?;

        let values = reply
            .into_int_list(2)
            .map_err(|e| RateLimitError::parse(OPERATION, e))?;
        let (success, count) = (values[0] == 1, values[1].max(0) as u64);

        if !success {
            debug!(window = %bucket.key, count, "Sliding window rejected take");
        }

        Ok(UseSlidingWindowResponse {
            success,
            remaining_capacity: remaining_capacity(bucket.maximum_capacity, count),
        })
    }

    fn now_nanos(&self) -> Result<i64> {
        let now: DateTime<Utc> = self.clock.now();
        now.timestamp_nanos_opt()
            .ok_or(RateLimitError::TimestampOutOfRange(now.timestamp()))
    }
}
