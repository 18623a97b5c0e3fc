//! Hivemind Limits - leaky bucket and sliding window rate limiters
//!
//! Local limiters keep their state in process memory and can block until a
//! token is available. Distributed limiters keep their state in a shared
//! store and express every call as one atomic script, so any number of
//! processes can enforce a single limit.

pub mod clock;
pub mod config;
pub mod distributed;
pub mod error;
pub mod local;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LeakyBucketOptions, LimitsConfig, SlidingWindowOptions};
pub use distributed::{
    DistributedLeakyBucket, DistributedSlidingWindow, InspectLeakyBucketResponse,
    InspectSlidingWindowResponse, UseLeakyBucketResponse, UseSlidingWindowResponse,
};
pub use error::{RateLimitError, Result};
pub use local::{LocalLeakyBucket, LocalLimiter, LocalSlidingWindow};
pub use store::{MemoryStore, ScriptExecutor};
