//! In-process sliding window.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::wait::{spawn_wait, wait_for_token};
use super::LocalLimiter;
use crate::error::{RateLimitError, Result};
use crate::ratelimit::sliding_window::remaining_capacity;

/// A sliding window held in process memory.
///
/// Every taken token is stored with its expiry, `duration` after it was
/// taken. At most `capacity` tokens may be live at once; each frees its slot
/// when it expires.
#[derive(Debug)]
pub struct LocalSlidingWindow {
    /// Max number of live tokens
    capacity: usize,
    /// How long each token stays in the window
    duration: Duration,
    /// Expiry of every live token, earliest first
    window: Mutex<VecDeque<Instant>>,
}

impl LocalSlidingWindow {
    /// Create an empty window admitting `capacity` tokens per `duration`.
    ///
    /// Fails with [`RateLimitError::InvalidDuration`] if `duration` is zero or
    /// too long to be measured from the current instant.
    pub fn new(capacity: usize, duration: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(RateLimitError::InvalidCapacity);
        }
        if duration.is_zero() || Instant::now().checked_add(duration).is_none() {
            return Err(RateLimitError::InvalidDuration);
        }

        Ok(Self {
            capacity,
            duration,
            window: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    /// Maximum number of live tokens.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How long each token stays in the window.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Number of tokens currently live in the window.
    pub fn size(&self) -> usize {
        let mut window = self.window.lock();
        evict_expired(&mut window, Instant::now());
        window.len()
    }

    /// Number of tokens that could be taken right now.
    pub fn remaining(&self) -> usize {
        remaining_capacity(self.capacity as u64, self.size() as u64) as usize
    }

    /// Wait until a slot frees up, then take it.
    pub async fn wait(&self) {
        wait_for_token(self, std::future::pending()).await;
    }

    /// Wait until a slot frees up or `cancel` completes.
    ///
    /// Returns `true` if a token was taken.
    pub async fn wait_with_cancel<F>(&self, cancel: F) -> bool
    where
        F: Future<Output = ()>,
    {
        wait_for_token(self, cancel).await
    }

    /// Wait for a slot on a separate task and run `callback` once a token is
    /// taken. If `cancel` completes first, `callback` is never called.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_func<F, C>(self: &Arc<Self>, cancel: F, callback: C) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        spawn_wait(Arc::clone(self), cancel, callback)
    }
}

impl LocalLimiter for LocalSlidingWindow {
    fn try_take_with_duration(&self) -> (bool, Duration) {
        let now = Instant::now();
        let mut window = self.window.lock();
        evict_expired(&mut window, now);

        if window.len() < self.capacity {
            let Some(expires_at) = now.checked_add(self.duration) else {
                return (false, self.duration);
            };
            window.push_back(expires_at);
            return (true, Duration::ZERO);
        }

        let retry_in = window
            .front()
            .map_or(Duration::ZERO, |earliest| earliest.saturating_duration_since(now));
        debug!(retry_in = ?retry_in, live = window.len(), "Sliding window full");
        (false, retry_in)
    }
}

/// Drop every expiry at or before `now`.
///
/// Expiries are pushed in clock order, so the expired ones are always a
/// prefix of the queue.
fn evict_expired(window: &mut VecDeque<Instant>, now: Instant) {
    while window.front().is_some_and(|expires_at| *expires_at <= now) {
        window.pop_front();
    }
}
