//! Atomic script execution against a shared store.
//!
//! Distributed limiters never read or write store keys directly. Every call
//! is one script submitted through [`ScriptExecutor`], which the store runs
//! indivisibly with respect to every other caller. Adding a backend means
//! implementing that one trait.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisConfig, RedisExecutor};

/// A named script with its Lua body.
///
/// Stores that run Lua (Redis and compatible servers) execute `body`;
/// other stores may dispatch on `name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    pub name: &'static str,
    pub body: &'static str,
}

/// A single script argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptArg {
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<i64> for ScriptArg {
    fn from(value: i64) -> Self {
        ScriptArg::Int(value)
    }
}

impl From<u64> for ScriptArg {
    fn from(value: u64) -> Self {
        ScriptArg::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ScriptArg {
    fn from(value: f64) -> Self {
        ScriptArg::Float(value)
    }
}

impl From<&str> for ScriptArg {
    fn from(value: &str) -> Self {
        ScriptArg::Str(value.to_string())
    }
}

/// A script reply: a scalar or an ordered list of replies.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptReply {
    Nil,
    Int(i64),
    Str(String),
    List(Vec<ScriptReply>),
}

impl ScriptReply {
    /// Short name of the reply type, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptReply::Nil => "nil",
            ScriptReply::Int(_) => "integer",
            ScriptReply::Str(_) => "string",
            ScriptReply::List(_) => "list",
        }
    }
}

/// Errors raised while executing a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The store does not know the script
    #[error("unknown script: {0}")]
    UnknownScript(String),

    /// The script ran but failed
    #[error("script runtime error: {0}")]
    Runtime(String),

    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Redis client errors
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// A reply did not have the shape a script promises.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("expected list but got {actual}")]
    NotAList { actual: &'static str },

    #[error("expected integer but got {actual}")]
    NotAnInteger { actual: &'static str },

    #[error("expected {expected} elements but got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("expected integer at index {index} but got {actual}")]
    ElementNotAnInteger { index: usize, actual: &'static str },
}

impl ScriptReply {
    /// Interpret the reply as a single integer.
    pub fn into_int(self) -> Result<i64, ReplyError> {
        match self {
            ScriptReply::Int(value) => Ok(value),
            other => Err(ReplyError::NotAnInteger {
                actual: other.kind(),
            }),
        }
    }

    /// Interpret the reply as a list of exactly `expected` integers.
    pub fn into_int_list(self, expected: usize) -> Result<Vec<i64>, ReplyError> {
        let items = match self {
            ScriptReply::List(items) => items,
            other => {
                return Err(ReplyError::NotAList {
                    actual: other.kind(),
                })
            }
        };

        if items.len() != expected {
            return Err(ReplyError::WrongLength {
                expected,
                actual: items.len(),
            });
        }

        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                ScriptReply::Int(value) => Ok(value),
                other => Err(ReplyError::ElementNotAnInteger {
                    index,
                    actual: other.kind(),
                }),
            })
            .collect()
    }
}

impl fmt::Display for ScriptReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptReply::Nil => write!(f, "(nil)"),
            ScriptReply::Int(value) => write!(f, "{}", value),
            ScriptReply::Str(value) => write!(f, "{:?}", value),
            ScriptReply::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Executes scripts atomically against a shared store.
///
/// Implementations must guarantee that a script's reads and writes are not
/// interleaved with any other script touching the same keys, and must not
/// retry failed executions.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Execute `script` with the given keys and arguments.
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, ScriptError>;
}

#[async_trait]
impl<E: ScriptExecutor + ?Sized> ScriptExecutor for Arc<E> {
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, ScriptError> {
        (**self).eval(script, keys, args).await
    }
}
