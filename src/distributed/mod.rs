//! Rate limiters backed by a shared store.
//!
//! These are thin clients: they hold no state of their own and express
//! every call as one atomic script execution, so every process pointing at
//! the same store and key enforces the same limit. They deliberately offer
//! no blocking wait; callers that want to wait must poll.

mod leaky_bucket;
pub mod scripts;
mod sliding_window;

pub use leaky_bucket::{DistributedLeakyBucket, InspectLeakyBucketResponse, UseLeakyBucketResponse};
pub use sliding_window::{
    DistributedSlidingWindow, InspectSlidingWindowResponse, UseSlidingWindowResponse,
};
