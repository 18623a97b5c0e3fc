//! Limiter configuration.
//!
//! Limiters take these structures directly. [`LimitsConfig`] groups several
//! of them so an embedding service can keep its bucket definitions in YAML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimitError, Result};

/// Options for a store-backed leaky bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakyBucketOptions {
    /// Prefix of the bucket's keys in the store.
    ///
    /// Two keys are written: `{prefix}::tokens` and `{prefix}::last_fill`.
    pub key_prefix: String,

    /// Maximum number of tokens in the bucket.
    ///
    /// Lowering this on an existing bucket shrinks it immediately. Raising it
    /// makes the bucket refill faster, but does not top it up at once.
    pub maximum_capacity: u64,

    /// Seconds needed to refill an empty bucket. Also the keys' TTL.
    ///
    /// The refill rate is `maximum_capacity / window_seconds` tokens per
    /// second, with a resolution of one second. At most `i64::MAX`, the
    /// largest TTL a store accepts.
    pub window_seconds: u64,
}

impl LeakyBucketOptions {
    /// Create options for the bucket at `key_prefix`.
    pub fn new(key_prefix: impl Into<String>, maximum_capacity: u64, window_seconds: u64) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            maximum_capacity,
            window_seconds,
        }
    }

    /// Check the options describe a usable bucket.
    pub fn validate(&self) -> Result<()> {
        if self.maximum_capacity == 0 {
            return Err(RateLimitError::InvalidCapacity);
        }
        if self.window_seconds == 0 || i64::try_from(self.window_seconds).is_err() {
            return Err(RateLimitError::InvalidDuration);
        }
        Ok(())
    }

    pub(crate) fn tokens_key(&self) -> String {
        format!("{}::tokens", self.key_prefix)
    }

    pub(crate) fn last_fill_key(&self) -> String {
        format!("{}::last_fill", self.key_prefix)
    }
}

/// Options for a store-backed sliding window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowOptions {
    /// Key of the window's sorted set in the store.
    pub key: String,

    /// Maximum number of tokens live in the window at any time.
    pub maximum_capacity: u64,

    /// How long each token stays in the window. At most `i64::MAX`
    /// nanoseconds, since expiries are stored as unix nanoseconds.
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
}

impl SlidingWindowOptions {
    /// Create options for the window at `key`.
    pub fn new(key: impl Into<String>, maximum_capacity: u64, window: Duration) -> Self {
        Self {
            key: key.into(),
            maximum_capacity,
            window,
        }
    }

    /// Check the options describe a usable window.
    pub fn validate(&self) -> Result<()> {
        if self.maximum_capacity == 0 {
            return Err(RateLimitError::InvalidCapacity);
        }
        if self.window.is_zero() || i64::try_from(self.window.as_nanos()).is_err() {
            return Err(RateLimitError::InvalidDuration);
        }
        Ok(())
    }
}

/// A set of named limiter definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Leaky bucket definitions
    #[serde(default)]
    pub leaky_buckets: Vec<LeakyBucketOptions>,

    /// Sliding window definitions
    #[serde(default)]
    pub sliding_windows: Vec<SlidingWindowOptions>,
}

impl LimitsConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limits configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string, validating every definition.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimitsConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse limits config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every definition.
    pub fn validate(&self) -> Result<()> {
        for bucket in &self.leaky_buckets {
            bucket.validate().map_err(|e| {
                RateLimitError::Config(format!("leaky bucket {:?}: {}", bucket.key_prefix, e))
            })?;
        }
        for window in &self.sliding_windows {
            window.validate().map_err(|e| {
                RateLimitError::Config(format!("sliding window {:?}: {}", window.key, e))
            })?;
        }
        Ok(())
    }

    /// Find a leaky bucket by key prefix.
    pub fn leaky_bucket(&self, key_prefix: &str) -> Option<&LeakyBucketOptions> {
        self.leaky_buckets.iter().find(|b| b.key_prefix == key_prefix)
    }

    /// Find a sliding window by key.
    pub fn sliding_window(&self, key: &str) -> Option<&SlidingWindowOptions> {
        self.sliding_windows.iter().find(|w| w.key == key)
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
