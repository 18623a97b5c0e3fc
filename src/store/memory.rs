//! In-process store that runs the limiter scripts natively.
//!
//! The whole keyspace sits behind one mutex, so a script touching several
//! keys is atomic in the same way a Redis script is. Keys expire after their
//! TTL, measured on the tokio clock.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{Script, ScriptArg, ScriptError, ScriptExecutor, ScriptReply};
use crate::distributed::scripts::names;
use crate::ratelimit::leaky_bucket::accrued_since;
use crate::ratelimit::BucketLevel;

/// An in-memory [`ScriptExecutor`].
///
/// Understands the scripts used by the distributed limiters and rejects
/// anything else with [`ScriptError::UnknownScript`]. State is local to the
/// process, so sharing a limit across processes still needs a real store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
enum Value {
    Str(String),
    SortedSet(SortedSet),
}

/// Members ordered by score, ties broken by member.
#[derive(Debug, Default)]
struct SortedSet {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn add(&mut self, score: i64, member: String) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.by_score.remove(&(old, member.clone()));
        }
        self.by_score.insert((score, member));
    }

    /// Remove every member scored at or below `max`. Always a prefix.
    fn remove_up_to(&mut self, max: i64) -> usize {
        let mut removed = 0;
        while let Some((score, _)) = self.by_score.first() {
            if *score > max {
                break;
            }
            if let Some((_, member)) = self.by_score.pop_first() {
                self.scores.remove(&member);
                removed += 1;
            }
        }
        removed
    }

    fn len(&self) -> usize {
        self.by_score.len()
    }
}

impl Keyspace {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| at <= now),
            None => return None,
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.entries.get_mut(key)
    }

    fn get_str(&mut self, key: &str, now: Instant) -> Result<Option<&str>, ScriptError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(value),
                ..
            }) => Ok(Some(value.as_str())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_str(&mut self, key: &str, value: String, expires_at: Instant) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: Some(expires_at),
            },
        );
    }

    fn sorted_set(
        &mut self,
        key: &str,
        now: Instant,
    ) -> Result<Option<&mut SortedSet>, ScriptError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Remove members scored at or below `max`, dropping the key once empty.
    fn remove_range(&mut self, key: &str, max: i64, now: Instant) -> Result<usize, ScriptError> {
        let (removed, empty) = match self.sorted_set(key, now)? {
            Some(set) => (set.remove_up_to(max), set.len() == 0),
            None => return Ok(0),
        };

        if empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    fn cardinality(&mut self, key: &str, now: Instant) -> Result<usize, ScriptError> {
        Ok(self.sorted_set(key, now)?.map_or(0, |set| set.len()))
    }

    fn add_member(
        &mut self,
        key: &str,
        score: i64,
        member: String,
        now: Instant,
    ) -> Result<(), ScriptError> {
        if let Some(set) = self.sorted_set(key, now)? {
            set.add(score, member);
            return Ok(());
        }

        let mut set = SortedSet::default();
        set.add(score, member);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::SortedSet(set),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn expire(&mut self, key: &str, expires_at: Instant, now: Instant) {
        if let Some(entry) = self.live(key, now) {
            entry.expires_at = Some(expires_at);
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently holds a live value.
    pub fn exists(&self, key: &str) -> bool {
        self.keyspace.lock().live(key, Instant::now()).is_some()
    }

    /// Time left before `key` expires, if it is live and has a TTL.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        keyspace
            .live(key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Drop every key.
    pub fn flush(&self) {
        self.keyspace.lock().entries.clear();
    }

    fn run(
        &self,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, ScriptError> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();

        match script.name {
            names::LEAKY_BUCKET_USE => leaky_bucket_use(&mut keyspace, keys, args, now),
            names::LEAKY_BUCKET_INSPECT => leaky_bucket_inspect(&mut keyspace, keys, args, now),
            names::SLIDING_WINDOW_USE => sliding_window_use(&mut keyspace, keys, args, now),
            names::SLIDING_WINDOW_INSPECT => sliding_window_inspect(&mut keyspace, keys, args, now),
            other => Err(ScriptError::UnknownScript(other.to_string())),
        }
    }
}

#[async_trait]
impl ScriptExecutor for MemoryStore {
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, ScriptError> {
        trace!(script = script.name, keys = ?keys, "Evaluating script in memory");
        self.run(script, keys, args)
    }
}

fn leaky_bucket_use(
    keyspace: &mut Keyspace,
    keys: &[String],
    args: &[ScriptArg],
    now: Instant,
) -> Result<ScriptReply, ScriptError> {
    let (tokens_key, last_fill_key) = (key(keys, 0)?, key(keys, 1)?);
    let take = non_negative(int_arg(args, 3)?, "take")?;
    let expires_at = expiry_arg(args, 4, now)?;

    let (mut level, last_fill) = refill_bucket(keyspace, tokens_key, last_fill_key, args, now)?;
    let success = level.take(take);

    keyspace.set_str(tokens_key, level.tokens().to_string(), expires_at);
    keyspace.set_str(last_fill_key, last_fill.to_string(), expires_at);

    Ok(ScriptReply::List(vec![
        ScriptReply::Int(i64::from(success)),
        ScriptReply::Int(level.tokens() as i64),
        ScriptReply::Int(last_fill),
    ]))
}

fn leaky_bucket_inspect(
    keyspace: &mut Keyspace,
    keys: &[String],
    args: &[ScriptArg],
    now: Instant,
) -> Result<ScriptReply, ScriptError> {
    let (tokens_key, last_fill_key) = (key(keys, 0)?, key(keys, 1)?);
    let (level, last_fill) = refill_bucket(keyspace, tokens_key, last_fill_key, args, now)?;

    Ok(ScriptReply::List(vec![
        ScriptReply::Int(level.tokens() as i64),
        ScriptReply::Int(last_fill),
    ]))
}

/// Load a bucket and apply the refill owed since its last fill.
///
/// ARGV: capacity, rate, now (unix seconds).
fn refill_bucket(
    keyspace: &mut Keyspace,
    tokens_key: &str,
    last_fill_key: &str,
    args: &[ScriptArg],
    now: Instant,
) -> Result<(BucketLevel, i64), ScriptError> {
    let capacity = non_negative(int_arg(args, 0)?, "capacity")?;
    let rate = float_arg(args, 1)?;
    let unix_now = int_arg(args, 2)?;

    let tokens = stored_int(keyspace.get_str(tokens_key, now)?).max(0) as u64;
    let mut last_fill = stored_int(keyspace.get_str(last_fill_key, now)?);

    let mut level = BucketLevel::load(tokens, capacity);
    if level.refill(accrued_since(last_fill, unix_now, rate)) {
        last_fill = unix_now;
    }

    Ok((level, last_fill))
}

fn sliding_window_use(
    keyspace: &mut Keyspace,
    keys: &[String],
    args: &[ScriptArg],
    now: Instant,
) -> Result<ScriptReply, ScriptError> {
    let window_key = key(keys, 0)?;
    let unix_now = int_arg(args, 0)?;
    let member_score = int_arg(args, 1)?;
    let expires_at = expiry_arg(args, 2, now)?;
    let capacity = non_negative(int_arg(args, 3)?, "capacity")?;

    keyspace.remove_range(window_key, unix_now, now)?;
    let mut count = keyspace.cardinality(window_key, now)? as u64;

    let success = count < capacity;
    if success {
        keyspace.add_member(window_key, member_score, member_score.to_string(), now)?;
        keyspace.expire(window_key, expires_at, now);
        count += 1;
    }

    Ok(ScriptReply::List(vec![
        ScriptReply::Int(i64::from(success)),
        ScriptReply::Int(count as i64),
    ]))
}

fn sliding_window_inspect(
    keyspace: &mut Keyspace,
    keys: &[String],
    args: &[ScriptArg],
    now: Instant,
) -> Result<ScriptReply, ScriptError> {
    let window_key = key(keys, 0)?;
    let unix_now = int_arg(args, 0)?;

    keyspace.remove_range(window_key, unix_now, now)?;
    let count = keyspace.cardinality(window_key, now)?;

    Ok(ScriptReply::Int(count as i64))
}

fn wrong_type(key: &str) -> ScriptError {
    ScriptError::Runtime(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

fn key(keys: &[String], index: usize) -> Result<&str, ScriptError> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| ScriptError::Runtime(format!("missing KEYS[{}]", index + 1)))
}

fn arg(args: &[ScriptArg], index: usize) -> Result<&ScriptArg, ScriptError> {
    args.get(index)
        .ok_or_else(|| ScriptError::Runtime(format!("missing ARGV[{}]", index + 1)))
}

fn int_arg(args: &[ScriptArg], index: usize) -> Result<i64, ScriptError> {
    match arg(args, index)? {
        ScriptArg::Int(value) => Ok(*value),
        ScriptArg::Float(value) => Ok(value.floor() as i64),
        ScriptArg::Str(value) => value
            .parse()
            .map_err(|_| ScriptError::Runtime(format!("ARGV[{}] is not an integer", index + 1))),
    }
}

fn float_arg(args: &[ScriptArg], index: usize) -> Result<f64, ScriptError> {
    match arg(args, index)? {
        ScriptArg::Int(value) => Ok(*value as f64),
        ScriptArg::Float(value) => Ok(*value),
        ScriptArg::Str(value) => value
            .parse()
            .map_err(|_| ScriptError::Runtime(format!("ARGV[{}] is not a number", index + 1))),
    }
}

/// Read a TTL in seconds and resolve it to the instant the key expires.
///
/// Non-positive TTLs and TTLs past what the clock can represent are both
/// rejected before anything is written.
fn expiry_arg(args: &[ScriptArg], index: usize, now: Instant) -> Result<Instant, ScriptError> {
    let seconds = int_arg(args, index)?;
    u64::try_from(seconds)
        .ok()
        .filter(|seconds| *seconds > 0)
        .and_then(|seconds| now.checked_add(Duration::from_secs(seconds)))
        .ok_or_else(|| ScriptError::Runtime("invalid expire time".to_string()))
}

fn non_negative(value: i64, name: &str) -> Result<u64, ScriptError> {
    u64::try_from(value).map_err(|_| ScriptError::Runtime(format!("{} must not be negative", name)))
}

/// Stored numbers that are missing or unparseable read as zero.
fn stored_int(value: Option<&str>) -> i64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}
