//! Scripts submitted by the distributed limiters.
//!
//! The Lua bodies live in `lua/` at the crate root. Stores that cannot run
//! Lua dispatch on the script name instead; see [`crate::store::MemoryStore`].

use crate::store::Script;

pub(crate) mod names {
    pub const LEAKY_BUCKET_USE: &str = "leaky_bucket_use";
    pub const LEAKY_BUCKET_INSPECT: &str = "leaky_bucket_inspect";
    pub const SLIDING_WINDOW_USE: &str = "sliding_window_use";
    pub const SLIDING_WINDOW_INSPECT: &str = "sliding_window_inspect";
}

/// KEYS: tokens, last_fill. ARGV: capacity, rate, now, take, ttl.
/// Replies `[success, tokens, last_fill]`.
pub const LEAKY_BUCKET_USE: Script = Script {
    name: names::LEAKY_BUCKET_USE,
    body: include_str!("../../lua/leaky_bucket_use.lua"),
};

/// KEYS: tokens, last_fill. ARGV: capacity, rate, now.
/// Replies `[tokens, last_fill]` without writing.
pub const LEAKY_BUCKET_INSPECT: Script = Script {
    name: names::LEAKY_BUCKET_INSPECT,
    body: include_str!("../../lua/leaky_bucket_inspect.lua"),
};

/// KEYS: window. ARGV: now, expires_at, ttl, capacity.
/// Replies `[success, count]`.
pub const SLIDING_WINDOW_USE: Script = Script {
    name: names::SLIDING_WINDOW_USE,
    body: include_str!("../../lua/sliding_window_use.lua"),
};

/// KEYS: window. ARGV: now. Replies the live count.
pub const SLIDING_WINDOW_INSPECT: Script = Script {
    name: names::SLIDING_WINDOW_INSPECT,
    body: include_str!("../../lua/sliding_window_inspect.lua"),
};
