//! Rate limiting arithmetic shared by local limiters and store backends.

pub mod leaky_bucket;
pub mod sliding_window;

pub use leaky_bucket::BucketLevel;
