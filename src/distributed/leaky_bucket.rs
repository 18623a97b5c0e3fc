//! Store-backed leaky bucket.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::scripts;
use crate::clock::{Clock, SystemClock};
use crate::config::LeakyBucketOptions;
use crate::error::{RateLimitError, Result};
use crate::ratelimit::leaky_bucket::{refill_rate, reset_at};
use crate::store::{ScriptArg, ScriptExecutor};

/// Response of [`DistributedLeakyBucket::take`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseLeakyBucketResponse {
    /// Whether the tokens were taken
    pub success: bool,
    /// Tokens left in the bucket
    pub remaining_tokens: u64,
    /// When the bucket will be full again
    pub reset_at: DateTime<Utc>,
}

/// Response of [`DistributedLeakyBucket::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectLeakyBucketResponse {
    /// Tokens currently in the bucket
    pub remaining_tokens: u64,
    /// When the bucket will be full again
    pub reset_at: DateTime<Utc>,
}

/// A leaky bucket whose state lives in a shared store.
///
/// The bucket lets callers burst up to its capacity and then refills at a
/// constant `maximum_capacity / window_seconds` tokens per second. Every call
/// is a single script execution, so any number of processes can share one
/// bucket without client-side locking.
///
/// A bucket that has not been touched for `window_seconds` expires from the
/// store and reads back as full.
#[derive(Debug)]
pub struct DistributedLeakyBucket<E> {
    executor: E,
    clock: Arc<dyn Clock>,
}

impl<E: ScriptExecutor> DistributedLeakyBucket<E> {
    /// Create a bucket client using the system clock.
    pub fn new(executor: E) -> Self {
        Self::with_clock(executor, Arc::new(SystemClock))
    }

    /// Create a bucket client reading time from `clock`.
    pub fn with_clock(executor: E, clock: Arc<dyn Clock>) -> Self {
        Self { executor, clock }
    }

    /// The underlying script executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Atomically try to take `take_amount` tokens from the bucket.
    ///
    /// Either every token is taken or none are. A rejection is reported with
    /// `success == false`, not as an error.
    pub async fn take(
        &self,
        bucket: &LeakyBucketOptions,
        take_amount: u64,
    ) -> Result<UseLeakyBucketResponse> {
        const OPERATION: &str = "leaky bucket use";

        bucket.validate()?;
        let now = self.clock.now().timestamp();

        trace!(
            bucket = %bucket.key_prefix,
            take = take_amount,
            "Checking leaky bucket"
        );

        let keys = [bucket.tokens_key(), bucket.last_fill_key()];
        let args = [
            ScriptArg::from(bucket.maximum_capacity),
            ScriptArg::from(refill_rate(bucket.maximum_capacity, bucket.window_seconds)),
            ScriptArg::from(now),
            ScriptArg::from(take_amount),
            ScriptArg::from(bucket.window_seconds),
        ];

        let reply = self
            .executor
            .eval(&scripts::LEAKY_BUCKET_USE, &keys, &args)
            .await
            .map_err(|e| RateLimitError::backend(OPERATION, e))?;

        let values = reply
            .into_int_list(3)
            .map_err(|e| RateLimitError::parse(OPERATION, e))?;
        let (success, remaining, last_fill) = (values[0] == 1, values[1].max(0) as u64, values[2]);

        if !success {
            debug!(
                bucket = %bucket.key_prefix,
                take = take_amount,
                remaining,
                "Leaky bucket rejected take"
            );
        }

        Ok(UseLeakyBucketResponse {
            success,
            remaining_tokens: remaining,
            reset_at: fill_time(bucket, last_fill, remaining)?,
        })
    }

    /// Read the bucket's current level without taking tokens.
    ///
    /// The refill owed since the last fill is included in the result but not
    /// written back.
    pub async fn inspect(&self, bucket: &LeakyBucketOptions) -> Result<InspectLeakyBucketResponse> {
        const OPERATION: &str = "leaky bucket inspect";

        bucket.validate()?;
        let now = self.clock.now().timestamp();

        let keys = [bucket.tokens_key(), bucket.last_fill_key()];
        let args = [
            ScriptArg::from(bucket.maximum_capacity),
            ScriptArg::from(refill_rate(bucket.maximum_capacity, bucket.window_seconds)),
            ScriptArg::from(now),
        ];

        let reply = self
            .executor
            .eval(&scripts::LEAKY_BUCKET_INSPECT, &keys, &args)
            .await
            .map_err(|e| RateLimitError::backend(OPERATION, e))?;

        let values = reply
            .into_int_list(2)
            .map_err(|e| RateLimitError::parse(OPERATION, e))?;
        let (remaining, last_fill) = (values[0].max(0) as u64, values[1]);

        Ok(InspectLeakyBucketResponse {
            remaining_tokens: remaining,
            reset_at: fill_time(bucket, last_fill, remaining)?,
        })
    }
}

fn fill_time(bucket: &LeakyBucketOptions, last_fill: i64, remaining: u64) -> Result<DateTime<Utc>> {
    reset_at(
        last_fill,
        remaining,
        bucket.maximum_capacity,
        bucket.window_seconds,
    )
    .and_then(|at| DateTime::from_timestamp(at, 0))
    .ok_or(RateLimitError::TimestampOutOfRange(last_fill))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, Script, ScriptError, ScriptReply};
    use async_trait::async_trait;
    use chrono::Duration;
    use tokio_test::{assert_err, assert_ok};

    /// Replies with a canned value or error.
    struct MockExecutor {
        reply: std::result::Result<ScriptReply, String>,
    }

    #[async_trait]
    impl ScriptExecutor for MockExecutor {
        async fn eval(
            &self,
            _script: &Script,
            _keys: &[String],
            _args: &[ScriptArg],
        ) -> std::result::Result<ScriptReply, ScriptError> {
            self.reply.clone().map_err(ScriptError::Unavailable)
        }
    }

    fn bucket_options() -> LeakyBucketOptions {
        LeakyBucketOptions::new("leaky-bucket", 60, 60)
    }

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ))
    }

    fn limiter(clock: &Arc<ManualClock>) -> DistributedLeakyBucket<MemoryStore> {
        DistributedLeakyBucket::with_clock(MemoryStore::new(), clock.clone())
    }

    #[tokio::test]
    async fn test_use_leaky_bucket() {
        let clock = test_clock();
        let now = clock.now();
        let limiter = limiter(&clock);

        let resp = limiter.take(&bucket_options(), 1).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.remaining_tokens, 59);
        assert_eq!(resp.reset_at, now + Duration::seconds(1));

        let resp = limiter.take(&bucket_options(), 1).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.remaining_tokens, 58);
        assert_eq!(resp.reset_at, now + Duration::seconds(2));

        // one token refills per second, but only whole seconds since the last fill
        clock.advance(Duration::seconds(3));

        let resp = limiter.take(&bucket_options(), 1).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.remaining_tokens, 59);
        assert_eq!(resp.reset_at, now + Duration::seconds(4));
    }

    #[tokio::test]
    async fn test_inspect_leaky_bucket() {
        let clock = test_clock();
        let now = clock.now();
        let limiter = limiter(&clock);

        let resp = limiter.inspect(&bucket_options()).await.unwrap();
        assert_eq!(resp.remaining_tokens, 60);
        assert_eq!(resp.reset_at, now);

        let resp = limiter.take(&bucket_options(), 1).await.unwrap();
        assert_eq!(resp.remaining_tokens, 59);
        assert_eq!(resp.reset_at, now + Duration::seconds(1));

        for _ in 0..3 {
            let resp = limiter.inspect(&bucket_options()).await.unwrap();
            assert_eq!(resp.remaining_tokens, 59);
            assert_eq!(resp.reset_at, now + Duration::seconds(1));
        }

        // inspecting did not consume anything
        let resp = limiter.take(&bucket_options(), 1).await.unwrap();
        assert_eq!(resp.remaining_tokens, 58);
    }

    #[tokio::test]
    async fn test_take_exact_remaining_empties_bucket() {
        let clock = test_clock();
        let limiter = limiter(&clock);

        let resp = limiter.take(&bucket_options(), 60).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.remaining_tokens, 0);
        assert_eq!(resp.reset_at, clock.now() + Duration::seconds(60));

        let resp = limiter.take(&bucket_options(), 1).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.remaining_tokens, 0);
    }

    #[tokio::test]
    async fn test_take_more_than_capacity_never_succeeds() {
        let clock = test_clock();
        let limiter = limiter(&clock);

        for _ in 0..3 {
            let resp = limiter.take(&bucket_options(), 61).await.unwrap();
            assert!(!resp.success);
            assert_eq!(resp.remaining_tokens, 60);
            clock.advance(Duration::seconds(120));
        }
    }

    #[tokio::test]
    async fn test_capacity_shrink_is_immediate() {
        let clock = test_clock();
        let limiter = limiter(&clock);

        limiter.take(&bucket_options(), 1).await.unwrap();

        let smaller = LeakyBucketOptions::new("leaky-bucket", 10, 60);
        let resp = limiter.take(&smaller, 1).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.remaining_tokens, 9);
    }

    #[tokio::test]
    async fn test_capacity_growth_phases_in() {
        let clock = test_clock();
        let limiter = limiter(&clock);
        let small = LeakyBucketOptions::new("leaky-bucket", 10, 10);
        let large = LeakyBucketOptions::new("leaky-bucket", 100, 10);

        let resp = limiter.take(&small, 1).await.unwrap();
        assert_eq!(resp.remaining_tokens, 9);

        // no time passed: growing the capacity credits nothing
        let resp = limiter.inspect(&large).await.unwrap();
        assert_eq!(resp.remaining_tokens, 9);

        // the larger capacity refills at 10 tokens per second
        clock.advance(Duration::seconds(1));
        let resp = limiter.inspect(&large).await.unwrap();
        assert_eq!(resp.remaining_tokens, 19);
    }

    #[tokio::test]
    async fn test_refill_is_monotonic() {
        let clock = test_clock();
        let limiter = limiter(&clock);
        let options = bucket_options();

        limiter.take(&options, 30).await.unwrap();

        let mut previous = 0;
        for _ in 0..40 {
            let resp = limiter.inspect(&options).await.unwrap();
            assert!(resp.remaining_tokens >= previous);
            assert!(resp.remaining_tokens <= options.maximum_capacity);
            previous = resp.remaining_tokens;
            clock.advance(Duration::seconds(1));
        }
        assert_eq!(previous, 60);
    }

    #[tokio::test]
    async fn test_random_sequences_stay_within_capacity() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(3);
        let clock = test_clock();
        let limiter = limiter(&clock);
        let options = LeakyBucketOptions::new("random", 25, 5);

        for _ in 0..300 {
            clock.advance(Duration::milliseconds(rng.gen_range(0..1_500)));
            let resp = limiter.take(&options, rng.gen_range(0..30)).await.unwrap();
            assert!(resp.remaining_tokens <= options.maximum_capacity);
        }
    }

    #[tokio::test]
    async fn test_shared_store_enforces_one_limit() {
        let clock = test_clock();
        let store = Arc::new(MemoryStore::new());
        let first = DistributedLeakyBucket::with_clock(store.clone(), clock.clone());
        let second = DistributedLeakyBucket::with_clock(store.clone(), clock.clone());
        let options = LeakyBucketOptions::new("shared", 4, 60);

        let results = futures::future::join_all(
            (0..8).map(|i| {
                let limiter = if i % 2 == 0 { &first } else { &second };
                limiter.take(&options, 1)
            }),
        )
        .await;

        let admitted = results
            .into_iter()
            .filter(|r| r.as_ref().map(|r| r.success).unwrap_or(false))
            .count();
        assert_eq!(admitted, 4);
    }

    #[tokio::test]
    async fn test_invalid_options_are_rejected() {
        let clock = test_clock();
        let limiter = limiter(&clock);

        let err = limiter
            .take(&LeakyBucketOptions::new("b", 0, 60), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidCapacity));

        assert_err!(limiter.inspect(&LeakyBucketOptions::new("b", 10, 0)).await);
    }

    #[tokio::test]
    async fn test_oversized_windows_return_errors() {
        let clock = test_clock();
        let limiter = limiter(&clock);

        let err = limiter
            .take(&LeakyBucketOptions::new("huge", 10, u64::MAX), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidDuration));

        // valid for the options, but too long a TTL for the store
        let options = LeakyBucketOptions::new("huge", 10, i64::MAX as u64);
        let err = limiter.take(&options, 1).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to execute leaky bucket use script: script runtime error: invalid expire time"
        );
        assert!(!limiter.executor().exists(&options.tokens_key()));
    }

    #[tokio::test]
    async fn test_unrepresentable_reset_time() {
        let limiter = DistributedLeakyBucket::new(MockExecutor {
            reply: Ok(ScriptReply::List(vec![
                ScriptReply::Int(1),
                ScriptReply::Int(0),
                ScriptReply::Int(i64::MAX - 5),
            ])),
        });

        let err = limiter.take(&bucket_options(), 1).await.unwrap_err();
        assert!(matches!(err, RateLimitError::TimestampOutOfRange(at) if at == i64::MAX - 5));
    }

    #[tokio::test]
    async fn test_executor_exposes_store_state() {
        let clock = test_clock();
        let limiter = limiter(&clock);
        let options = bucket_options();

        assert!(!limiter.executor().exists(&options.tokens_key()));
        limiter.take(&options, 1).await.unwrap();
        assert!(limiter.executor().exists(&options.tokens_key()));
        assert!(limiter.executor().exists(&options.last_fill_key()));
    }

    #[tokio::test]
    async fn test_use_leaky_bucket_errors() {
        let cases = [
            (
                Err("connection refused".to_string()),
                "failed to execute leaky bucket use script: store unavailable: connection refused",
            ),
            (
                Ok(ScriptReply::Str("foo".to_string())),
                "parsing leaky bucket use reply: expected list but got string",
            ),
            (
                Ok(ScriptReply::List(vec![ScriptReply::Int(1), ScriptReply::Int(2)])),
                "parsing leaky bucket use reply: expected 3 elements but got 2",
            ),
            (
                Ok(ScriptReply::List(vec![
                    ScriptReply::Int(1),
                    ScriptReply::Str("2".to_string()),
                    ScriptReply::Int(3),
                ])),
                "parsing leaky bucket use reply: expected integer at index 1 but got string",
            ),
        ];

        for (reply, message) in cases {
            let limiter = DistributedLeakyBucket::new(MockExecutor { reply });
            let err = limiter.take(&bucket_options(), 1).await.unwrap_err();
            assert_eq!(err.to_string(), message);
        }
    }

    #[tokio::test]
    async fn test_inspect_leaky_bucket_errors() {
        let limiter = DistributedLeakyBucket::new(MockExecutor {
            reply: Err("connection refused".to_string()),
        });
        let err = limiter.inspect(&bucket_options()).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Backend { operation: "leaky bucket inspect", .. }));

        let limiter = DistributedLeakyBucket::new(MockExecutor {
            reply: Ok(ScriptReply::Str("foo".to_string())),
        });
        let err = limiter.inspect(&bucket_options()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "parsing leaky bucket inspect reply: expected list but got string"
        );
    }

    #[tokio::test]
    async fn test_system_clock_by_default() {
        let limiter = DistributedLeakyBucket::new(MemoryStore::new());
        let resp = assert_ok!(limiter.take(&bucket_options(), 1).await);

        let delta = resp.reset_at - Utc::now();
        assert!(delta.num_seconds().abs() < 60);
    }
}
