//! Redis-backed script executor.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client, Value};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use super::{Script, ScriptArg, ScriptError, ScriptExecutor, ScriptReply};

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://localhost:6379`
    pub url: String,
    /// How long to wait for the initial connection
    #[serde(with = "crate::config::duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Runs limiter scripts on a Redis server (or anything speaking its
/// scripting protocol).
///
/// Scripts are sent with `EVALSHA` and loaded on a `NOSCRIPT` miss. The
/// connection manager reconnects on its own; the executor never retries a
/// failed script.
pub struct RedisExecutor {
    conn: ConnectionManager,
    scripts: Mutex<HashMap<&'static str, redis::Script>>,
}

impl RedisExecutor {
    /// Connect to the server described by `config`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, ScriptError> {
        let client = Client::open(config.url.as_str())?;

        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                ScriptError::Unavailable(format!("connecting to {} timed out", config.url))
            })??;

        info!(url = %config.url, "Connected to Redis");
        Ok(Self::new(conn))
    }

    /// Wrap an existing connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, script: &Script) -> redis::Script {
        self.scripts
            .lock()
            .entry(script.name)
            .or_insert_with(|| redis::Script::new(script.body))
            .clone()
    }
}

impl std::fmt::Debug for RedisExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisExecutor")
            .field("scripts", &self.scripts.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ScriptExecutor for RedisExecutor {
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, ScriptError> {
        trace!(script = script.name, ?keys, "Executing Redis script");

        let lua = self.script(script);
        let mut invocation = lua.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            match arg {
                ScriptArg::Int(value) => invocation.arg(*value),
                ScriptArg::Float(value) => invocation.arg(*value),
                ScriptArg::Str(value) => invocation.arg(value.as_str()),
            };
        }

        let mut conn = self.conn.clone();
        let value: Value = invocation.invoke_async(&mut conn).await?;
        Ok(into_reply(value))
    }
}

fn into_reply(value: Value) -> ScriptReply {
    match value {
        Value::Nil => ScriptReply::Nil,
        Value::Int(value) => ScriptReply::Int(value),
        Value::BulkString(bytes) => ScriptReply::Str(String::from_utf8_lossy(&bytes).into_owned()),
        Value::SimpleString(value) => ScriptReply::Str(value),
        Value::Okay => ScriptReply::Str("OK".to_string()),
        Value::Array(items) | Value::Set(items) => {
            ScriptReply::List(items.into_iter().map(into_reply).collect())
        }
        other => ScriptReply::Str(format!("{:?}", other)),
    }
}
