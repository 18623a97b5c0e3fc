//! In-process leaky bucket.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::wait::{spawn_wait, wait_for_token};
use super::LocalLimiter;
use crate::error::{RateLimitError, Result};
use crate::ratelimit::BucketLevel;

/// A leaky bucket held in process memory.
///
/// The bucket starts full and refills at a constant rate of
/// `tokens_per_window / window`: 10 tokens per second refill one token every
/// 100ms. It never holds more than `tokens_per_window` tokens, so callers can
/// burst up to that many and are then throttled to the refill rate. A
/// [`LocalSlidingWindow`](super::LocalSlidingWindow) instead frees every
/// expired slot at once.
///
/// Refill is counted in whole intervals since the last fill; partial
/// intervals are dropped when a refill happens.
#[derive(Debug)]
pub struct LocalLeakyBucket {
    /// Time needed to accrue one token
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    level: BucketLevel,
    last_fill: Instant,
}

impl BucketState {
    /// Top the bucket up with the tokens accrued since the last fill.
    fn fill(&mut self, refill_interval: Duration, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_fill);
        let accrued = (elapsed.as_nanos() / refill_interval.as_nanos()) as u64;

        if self.level.refill(accrued) {
            self.last_fill = now;
        }
    }
}

impl LocalLeakyBucket {
    /// Create a full bucket allowing `tokens_per_window` tokens per `window`.
    ///
    /// Fails with [`RateLimitError::InvalidDuration`] if `window` is zero or
    /// too long to be measured from the current instant.
    pub fn new(tokens_per_window: u64, window: Duration) -> Result<Self> {
        if tokens_per_window == 0 {
            return Err(RateLimitError::InvalidCapacity);
        }

        let now = Instant::now();
        if window.is_zero() || now.checked_add(window).is_none() {
            return Err(RateLimitError::InvalidDuration);
        }

        let refill_interval = u64::try_from(window.as_nanos() / u128::from(tokens_per_window))
            .map(Duration::from_nanos)
            .map_err(|_| RateLimitError::InvalidDuration)?
            .max(Duration::from_nanos(1));

        Ok(Self {
            refill_interval,
            state: Mutex::new(BucketState {
                level: BucketLevel::full(tokens_per_window),
                last_fill: now,
            }),
        })
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> u64 {
        self.state.lock().level.capacity()
    }

    /// Time needed to accrue one token.
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Number of tokens currently available.
    pub fn size(&self) -> u64 {
        let mut state = self.state.lock();
        state.fill(self.refill_interval, Instant::now());
        state.level.tokens()
    }

    /// Attempt to take `amount` tokens at once. Either all are taken or none.
    pub fn try_take_amount(&self, amount: u64) -> bool {
        let mut state = self.state.lock();
        state.fill(self.refill_interval, Instant::now());

        let taken = state.level.take(amount);
        trace!(amount, taken, remaining = state.level.tokens(), "Leaky bucket take");
        taken
    }

    /// Wait until a token is available, then take it.
    pub async fn wait(&self) {
        wait_for_token(self, std::future::pending()).await;
    }

    /// Wait until a token is available or `cancel` completes.
    ///
    /// Returns `true` if a token was taken.
    pub async fn wait_with_cancel<F>(&self, cancel: F) -> bool
    where
        F: Future<Output = ()>,
    {
        wait_for_token(self, cancel).await
    }

    /// Wait for a token on a separate task and run `callback` once it is
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

impl LocalLimiter for LocalLeakyBucket {
    fn try_take_with_duration(&self) -> (bool, Duration) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.fill(self.refill_interval, now);

        if state.level.take(1) {
            return (true, Duration::ZERO);
        }

        let retry_in = state
            .last_fill
            .checked_add(self.refill_interval)
            .map_or(self.refill_interval, |next| next.saturating_duration_since(now));
        debug!(retry_in = ?retry_in, "Leaky bucket empty");
        (false, retry_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_rejects_invalid_arguments() {
        assert!(matches!(
            LocalLeakyBucket::new(0, Duration::from_secs(1)),
            Err(RateLimitError::InvalidCapacity)
        ));
        assert!(matches!(
            LocalLeakyBucket::new(10, Duration::ZERO),
            Err(RateLimitError::InvalidDuration)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_windows_past_the_clock() {
        assert!(matches!(
            LocalLeakyBucket::new(1, Duration::MAX),
            Err(RateLimitError::InvalidDuration)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_very_long_window_reports_retry() {
        let century = Duration::from_secs(100 * 365 * 24 * 60 * 60);
        let bucket = LocalLeakyBucket::new(1, century).unwrap();

        assert_eq!(bucket.try_take_with_duration(), (true, Duration::ZERO));
        assert_eq!(bucket.try_take_with_duration(), (false, century));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            bucket.try_take_with_duration(),
            (false, century - Duration::from_secs(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratelimits_properly() {
        let bucket = LocalLeakyBucket::new(10, Duration::from_secs(2)).unwrap();
        assert_eq!(bucket.size(), 10);

        for _ in 0..10 {
            assert!(bucket.try_take());
        }

        assert_eq!(bucket.size(), 0);
        assert!(!bucket.try_take());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refills_one_token_per_interval() {
        let bucket = LocalLeakyBucket::new(10, Duration::from_secs(1)).unwrap();
        assert_eq!(bucket.refill_interval(), Duration::from_millis(100));

        for _ in 0..10 {
            assert!(bucket.try_take());
        }

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(bucket.size(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(bucket.size(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(bucket.size(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_correct_take_duration() {
        let bucket = LocalLeakyBucket::new(2, Duration::from_secs(1)).unwrap();

        for _ in 0..2 {
            assert_eq!(bucket.try_take_with_duration(), (true, Duration::ZERO));
        }

        let (taken, retry_in) = bucket.try_take_with_duration();
        assert!(!taken);
        assert_eq!(retry_in, Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(200)).await;
        let (taken, retry_in) = bucket.try_take_with_duration();
        assert!(!taken);
        assert_eq!(retry_in, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_amount_is_all_or_nothing() {
        let bucket = LocalLeakyBucket::new(5, Duration::from_secs(5)).unwrap();

        assert!(!bucket.try_take_amount(6));
        assert_eq!(bucket.size(), 5);

        assert!(bucket.try_take_amount(5));
        assert_eq!(bucket.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_token_is_available() {
        let bucket = LocalLeakyBucket::new(10, Duration::from_secs(1)).unwrap();
        for _ in 0..10 {
            assert!(bucket.try_take());
        }

        let start = Instant::now();
        bucket.wait().await;

        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(bucket.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_cancel_gives_up() {
        let bucket = LocalLeakyBucket::new(1, Duration::from_secs(10)).unwrap();
        assert!(bucket.try_take());

        let taken = bucket
            .wait_with_cancel(tokio::time::sleep(Duration::from_secs(1)))
            .await;

        assert!(!taken);
        assert_eq!(bucket.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_call_back_when_cancelled() {
        let bucket = Arc::new(LocalLeakyBucket::new(2, Duration::from_millis(250)).unwrap());
        for _ in 0..2 {
            assert!(bucket.try_take());
        }

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let called = Arc::new(AtomicBool::new(false));

        let flag = called.clone();
        let handle = bucket.wait_func(
            async move {
                let _ = cancel_rx.await;
            },
            move || flag.store(true, Ordering::SeqCst),
        );
        cancel_tx.send(()).unwrap();

        handle.await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_back_in_wait_func() {
        let bucket = Arc::new(LocalLeakyBucket::new(2, Duration::from_secs(1)).unwrap());
        for _ in 0..2 {
            assert!(bucket.try_take());
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let start = Instant::now();
        bucket.wait_func(std::future::pending(), move || {
            let _ = tx.send(());
        });

        rx.await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn test_concurrent_takes_never_oversell() {
        let bucket = Arc::new(LocalLeakyBucket::new(100, Duration::from_secs(3600)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || (0..50).filter(|_| bucket.try_take()).count())
            })
            .collect();

        let taken: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(taken, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_sequences_stay_within_capacity() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let bucket = LocalLeakyBucket::new(20, Duration::from_secs(2)).unwrap();

        for _ in 0..500 {
            if rng.gen_bool(0.3) {
                let before = bucket.size();
                tokio::time::advance(Duration::from_millis(rng.gen_range(0..300))).await;
                // refill never loses tokens
                assert!(bucket.size() >= before);
            }
            bucket.try_take_amount(rng.gen_range(0..25));
            assert!(bucket.size() <= bucket.capacity());
        }
    }
}
