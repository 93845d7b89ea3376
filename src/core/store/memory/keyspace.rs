// src/core/store/memory/keyspace.rs

//! The sharded in-memory keyspace behind `MemoryStore`, and the small command
//! interpreter scripts use to reach it.

use crate::core::BrokerError;
use crate::core::store::RespValue;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

/// The number of shards in the keyspace.
pub const NUM_SHARDS: usize = 16;

#[derive(Debug, Clone)]
pub enum StoredValue {
    String(Bytes),
    Hash(HashMap<String, Bytes>),
    /// Member to score. Ordering is computed when ranges are read.
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn persistent(value: StoredValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Write condition for `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    Always,
    IfAbsent,
    IfPresent,
}

type Shard = HashMap<String, Entry>;

#[derive(Debug)]
pub struct Keyspace {
    shards: Vec<Mutex<Shard>>,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type() -> BrokerError {
    BrokerError::Store(
        "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
    )
}

fn not_integer() -> BrokerError {
    BrokerError::Store("ERR value is not an integer or out of range".into())
}

fn syntax_error() -> BrokerError {
    BrokerError::Store("ERR syntax error".into())
}

fn arity(cmd: &str) -> BrokerError {
    BrokerError::Store(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd.to_ascii_lowercase()
    ))
}

/// Drops `key` if it has expired, so callers only ever observe live entries.
fn purge_if_expired(shard: &mut Shard, key: &str) {
    if shard
        .get(key)
        .is_some_and(|e| e.is_expired(Instant::now()))
    {
        shard.remove(key);
    }
}

fn live_entry<'a>(shard: &'a mut Shard, key: &str) -> Option<&'a mut Entry> {
    purge_if_expired(shard, key);
    shard.get_mut(key)
}

/// Clamps a Redis-style inclusive rank range to `len` elements.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl Keyspace {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards }
    }

    fn shard(&self, key: &str) -> MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.shards[(hasher.finish() as usize) % NUM_SHARDS].lock()
    }

    pub fn get(&self, key: &str) -> Result<Option<Bytes>, BrokerError> {
        let mut shard = self.shard(key);
        match live_entry(&mut shard, key) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::String(b),
                ..
            }) => Ok(Some(b.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Returns true if the value was written.
    pub fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>, cond: SetCondition) -> bool {
        let mut shard = self.shard(key);
        let exists = live_entry(&mut shard, key).is_some();
        match cond {
            SetCondition::IfAbsent if exists => return false,
            SetCondition::IfPresent if !exists => return false,
            _ => {}
        }
        shard.insert(
            key.to_string(),
            Entry {
                value: StoredValue::String(value),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        true
    }

    pub fn exists(&self, key: &str) -> bool {
        live_entry(&mut self.shard(key), key).is_some()
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut shard = self.shard(key);
        live_entry(&mut shard, key).is_some() && shard.remove(key).is_some()
    }

    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let mut shard = self.shard(key);
        match live_entry(&mut shard, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    /// Remaining time to live in milliseconds: -2 if the key is absent, -1 if
    /// it never expires.
    pub fn pttl(&self, key: &str) -> i64 {
        let mut shard = self.shard(key);
        match live_entry(&mut shard, key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_millis() as i64,
        }
    }

    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BrokerError> {
        let mut shard = self.shard(key);
        match live_entry(&mut shard, key) {
            Some(entry) => {
                let StoredValue::String(current) = &entry.value else {
                    return Err(wrong_type());
                };
                let current: i64 = std::str::from_utf8(current)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(not_integer)?;
                let next = current.checked_add(delta).ok_or_else(|| {
                    BrokerError::Store("ERR increment or decrement would overflow".into())
                })?;
                entry.value = StoredValue::String(Bytes::from(next.to_string()));
                Ok(next)
            }
            None => {
                shard.insert(
                    key.to_string(),
                    Entry::persistent(StoredValue::String(Bytes::from(delta.to_string()))),
                );
                Ok(delta)
            }
        }
    }

    /// Returns true if the field is new.
    pub fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<bool, BrokerError> {
        let mut shard = self.shard(key);
        purge_if_expired(&mut shard, key);
        let entry = shard
            .entry(key.to_string())
            .or_insert_with(|| Entry::persistent(StoredValue::Hash(HashMap::new())));
        let StoredValue::Hash(hash) = &mut entry.value else {
            return Err(wrong_type());
        };
        Ok(hash.insert(field.to_string(), value).is_none())
    }

    pub fn hash_get(&self, key: &str, field: &str) -> Result<Option<Bytes>, BrokerError> {
        let mut shard = self.shard(key);
        match live_entry(&mut shard, key) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type()),
        }
    }

    pub fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Bytes)>, BrokerError> {
        let mut shard = self.shard(key);
        match live_entry(&mut shard, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: StoredValue::Hash(hash),
                ..
            }) => Ok(hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect()),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Removes a hash field; an emptied hash is removed with it.
    pub fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError> {
        let mut shard = self.shard(key);
        let (removed, now_empty) = match live_entry(&mut shard, key) {
            None => return Ok(false),
            Some(Entry {
                value: StoredValue::Hash(hash),
                ..
            }) => (hash.remove(field).is_some(), hash.is_empty()),
            Some(_) => return Err(wrong_type()),
        };
        if now_empty {
            shard.remove(key);
        }
        Ok(removed)
    }

    /// Returns the number of members that were not already present.
    pub fn sorted_set_add(&self, key: &str, members: &[(f64, String)]) -> Result<usize, BrokerError> {
        let mut shard = self.shard(key);
        purge_if_expired(&mut shard, key);
        let entry = shard
            .entry(key.to_string())
            .or_insert_with(|| Entry::persistent(StoredValue::SortedSet(HashMap::new())));
        let StoredValue::SortedSet(set) = &mut entry.value else {
            return Err(wrong_type());
        };
        let mut added = 0;
        for (score, member) in members {
            if set.insert(member.clone(), *score).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn sorted_set_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, BrokerError> {
        let mut shard = self.shard(key);
        let set = match live_entry(&mut shard, key) {
            None => return Ok(Vec::new()),
            Some(Entry {
                value: StoredValue::SortedSet(set),
                ..
            }) => set,
            Some(_) => return Err(wrong_type()),
        };
        let mut ordered: Vec<(&String, f64)> = set.iter().map(|(m, s)| (m, *s)).collect();
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        let Some((from, to)) = normalize_range(ordered.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(ordered[from..=to].iter().map(|(m, _)| (*m).clone()).collect())
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let before = shard.len();
                shard.retain(|_, entry| !entry.is_expired(now));
                before - shard.len()
            })
            .sum()
    }

    /// Number of stored entries, including ones expired but not yet purged.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Executes one command in RESP argument form. Failures are returned as
    /// error replies, as a Redis server would.
    pub fn execute(&self, args: &[Bytes]) -> RespValue {
        match self.dispatch(args) {
            Ok(reply) => reply,
            Err(BrokerError::Store(msg)) => RespValue::Error(msg),
            Err(e) => RespValue::Error(format!("ERR {e}")),
        }
    }

    fn dispatch(&self, args: &[Bytes]) -> Result<RespValue, BrokerError> {
        let Some((name, rest)) = args.split_first() else {
            return Err(BrokerError::Store(
                "ERR Please specify at least one argument".into(),
            ));
        };
        let name = std::str::from_utf8(name)?.to_ascii_uppercase();

        match name.as_str() {
            "GET" => {
                let [key] = rest else { return Err(arity(&name)) };
                Ok(self
                    .get(str_arg(key)?)?
                    .map_or(RespValue::Null, RespValue::BulkString))
            }
            "SET" => {
                let [key, value, opts @ ..] = rest else {
                    return Err(arity(&name));
                };
                let (ttl, cond) = parse_set_options(opts)?;
                if self.set(str_arg(key)?, value.clone(), ttl, cond) {
                    Ok(RespValue::SimpleString("OK".into()))
                } else {
                    Ok(RespValue::Null)
                }
            }
            "DEL" | "EXISTS" => {
                if rest.is_empty() {
                    return Err(arity(&name));
                }
                let mut count = 0;
                for key in rest {
                    let key = str_arg(key)?;
                    let hit = if name == "DEL" {
                        self.delete(key)
                    } else {
                        self.exists(key)
                    };
                    count += hit as i64;
                }
                Ok(RespValue::Integer(count))
            }
            "EXPIRE" | "PEXPIRE" => {
                let [key, amount] = rest else { return Err(arity(&name)) };
                let key = str_arg(key)?;
                let amount = int_arg(amount)?;
                // A non-positive timeout deletes the key.
                let applied = if amount <= 0 {
                    self.delete(key)
                } else if name == "EXPIRE" {
                    self.expire(key, Duration::from_secs(amount as u64))
                } else {
                    self.expire(key, Duration::from_millis(amount as u64))
                };
                Ok(RespValue::Integer(applied as i64))
            }
            "PTTL" | "TTL" => {
                let [key] = rest else { return Err(arity(&name)) };
                let ms = self.pttl(str_arg(key)?);
                if name == "TTL" && ms >= 0 {
                    Ok(RespValue::Integer((ms + 500) / 1000))
                } else {
                    Ok(RespValue::Integer(ms))
                }
            }
            "INCR" => {
                let [key] = rest else { return Err(arity(&name)) };
                Ok(RespValue::Integer(self.incr_by(str_arg(key)?, 1)?))
            }
            "INCRBY" => {
                let [key, delta] = rest else { return Err(arity(&name)) };
                Ok(RespValue::Integer(
                    self.incr_by(str_arg(key)?, int_arg(delta)?)?,
                ))
            }
            "HSET" => {
                let [key, pairs @ ..] = rest else { return Err(arity(&name)) };
                if pairs.is_empty() || pairs.len() % 2 != 0 {
                    return Err(arity(&name));
                }
                let key = str_arg(key)?;
                let mut added = 0;
                for pair in pairs.chunks_exact(2) {
                    added += self.hash_set(key, str_arg(&pair[0])?, pair[1].clone())? as i64;
                }
                Ok(RespValue::Integer(added))
            }
            "HGET" => {
                let [key, field] = rest else { return Err(arity(&name)) };
                Ok(self
                    .hash_get(str_arg(key)?, str_arg(field)?)?
                    .map_or(RespValue::Null, RespValue::BulkString))
            }
            "HGETALL" => {
                let [key] = rest else { return Err(arity(&name)) };
                let flat = self
                    .hash_get_all(str_arg(key)?)?
                    .into_iter()
                    .flat_map(|(f, v)| {
                        [RespValue::BulkString(Bytes::from(f)), RespValue::BulkString(v)]
                    })
                    .collect();
                Ok(RespValue::Array(flat))
            }
            "HDEL" => {
                let [key, fields @ ..] = rest else { return Err(arity(&name)) };
                if fields.is_empty() {
                    return Err(arity(&name));
                }
                let key = str_arg(key)?;
                let mut removed = 0;
                for field in fields {
                    removed += self.hash_delete(key, str_arg(field)?)? as i64;
                }
                Ok(RespValue::Integer(removed))
            }
            "ZADD" => {
                let [key, pairs @ ..] = rest else { return Err(arity(&name)) };
                if pairs.is_empty() || pairs.len() % 2 != 0 {
                    return Err(syntax_error());
                }
                let members = pairs
                    .chunks_exact(2)
                    .map(|p| Ok((float_arg(&p[0])?, str_arg(&p[1])?.to_string())))
                    .collect::<Result<Vec<_>, BrokerError>>()?;
                Ok(RespValue::Integer(
                    self.sorted_set_add(str_arg(key)?, &members)? as i64,
                ))
            }
            "ZRANGE" => {
                let [key, start, stop] = rest else { return Err(arity(&name)) };
                let members = self
                    .sorted_set_range(str_arg(key)?, int_arg(start)?, int_arg(stop)?)?
                    .into_iter()
                    .map(|m| RespValue::BulkString(Bytes::from(m)))
                    .collect();
                Ok(RespValue::Array(members))
            }
            "PING" => Ok(RespValue::SimpleString("PONG".into())),
            other => Err(BrokerError::Store(format!(
                "ERR unknown command '{}'",
                other.to_ascii_lowercase()
            ))),
        }
    }
}

fn parse_set_options(opts: &[Bytes]) -> Result<(Option<Duration>, SetCondition), BrokerError> {
    let mut ttl = None;
    let mut cond = SetCondition::Always;
    let mut i = 0;
    while i < opts.len() {
        let opt = std::str::from_utf8(&opts[i])?.to_ascii_uppercase();
        match opt.as_str() {
            "NX" => cond = SetCondition::IfAbsent,
            "XX" => cond = SetCondition::IfPresent,
            "EX" | "PX" => {
                let amount = int_arg(opts.get(i + 1).ok_or_else(syntax_error)?)?;
                if amount <= 0 {
                    return Err(BrokerError::Store(
                        "ERR invalid expire time in 'set' command".into(),
                    ));
                }
                ttl = Some(if opt == "EX" {
                    Duration::from_secs(amount as u64)
                } else {
                    Duration::from_millis(amount as u64)
                });
                i += 1;
            }
            _ => return Err(syntax_error()),
        }
        i += 1;
    }
    Ok((ttl, cond))
}

fn str_arg(arg: &Bytes) -> Result<&str, BrokerError> {
    Ok(std::str::from_utf8(arg)?)
}

fn int_arg(arg: &Bytes) -> Result<i64, BrokerError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(not_integer)
}

fn float_arg(arg: &Bytes) -> Result<f64, BrokerError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or_else(|| BrokerError::Store("ERR value is not a valid float".into()))
}
