//! Leaky bucket arithmetic.
//!
//! The same rules apply to a bucket held in process memory and to one held
//! in a shared store, so both sides build on the types here.

/// Token level of a leaky bucket.
///
/// The level never exceeds its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLevel {
    tokens: u64,
    capacity: u64,
}

impl BucketLevel {
    /// Load a level, shrinking it to `capacity` if it was stored under a
    /// larger one.
    pub fn load(tokens: u64, capacity: u64) -> Self {
        Self {
            tokens: tokens.min(capacity),
            capacity,
        }
    }

    /// A bucket holding `capacity` tokens.
    pub fn full(capacity: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
        }
    }

    /// Tokens currently available.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether the bucket holds its full capacity.
    pub fn is_full(&self) -> bool {
        self.tokens >= self.capacity
    }

    /// Add `accrued` tokens, capped at capacity.
    ///
    /// Returns `true` when the bucket was below capacity and at least one
    /// token accrued. The caller must then move its last fill time to now;
    /// otherwise the last fill time stays put so partial progress towards
    /// the next token is kept.
    pub fn refill(&mut self, accrued: u64) -> bool {
        if self.is_full() || accrued == 0 {
            return false;
        }

        self.tokens = self.tokens.saturating_add(accrued).min(self.capacity);
        true
    }

    /// Take `amount` tokens, all or nothing.
    pub fn take(&mut self, amount: u64) -> bool {
        if self.tokens < amount {
            return false;
        }

        self.tokens -= amount;
        true
    }
}

/// Tokens regenerated per second.
pub fn refill_rate(capacity: u64, window_seconds: u64) -> f64 {
    capacity as f64 / window_seconds as f64
}

/// Whole tokens accrued between `last_fill` and `now` (unix seconds).
///
/// Fractional accrual is truncated, so at low rates the first token only
/// appears once a full token's worth of time has passed.
pub fn accrued_since(last_fill: i64, now: i64, rate: f64) -> u64 {
    if now <= last_fill {
        return 0;
    }

    ((now - last_fill) as f64 * rate).floor() as u64
}

/// Unix second at which a bucket holding `remaining` tokens is full again.
///
/// A full bucket is already reset at its last fill. Otherwise the time is
/// the number of seconds needed to accrue the missing tokens, bounded by the
/// window, since a bucket must be full once a whole window has passed.
///
/// Returns `None` if the result does not fit in a unix timestamp.
pub fn reset_at(last_fill: i64, remaining: u64, capacity: u64, window_seconds: u64) -> Option<i64> {
    let delta = capacity.saturating_sub(remaining);
    if delta == 0 {
        return Some(last_fill);
    }

    let rate = refill_rate(capacity, window_seconds);
    let seconds_till_full = ((delta as f64 / rate).ceil() as u64).min(window_seconds);

    last_fill.checked_add(i64::try_from(seconds_till_full).ok()?)
}
