//! Expiring key-value store behind the service registry
//!
//! `RedisStore` is the shared store used in a deployment. `MemoryStore` keeps
//! the same TTL semantics in-process for single-node mode and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{timeout, Instant};

use crate::error::{Error, Result};

/// Page size hint for SCAN
const SCAN_COUNT: usize = 100;

/// Store operations the registry relies on
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Write `value` under `key`, expiring after `ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Keys matching a glob pattern with a single trailing `*`
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    async fn sadd(&self, set: &str, member: &str) -> Result<()>;

    async fn srem(&self, set: &str, member: &str) -> Result<()>;

    async fn smembers(&self, set: &str) -> Result<Vec<String>>;
}

/// Redis-backed registry store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis, bounding the initial handshake by `op_timeout`
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let conn = timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))?
            .map_err(|e| Error::Store(format!("Redis connection failed: {e}")))?;

        Ok(Self { conn, op_timeout })
    }

    async fn query<T: redis::FromRedisValue>(&self, name: &str, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        timeout(self.op_timeout, cmd.query_async::<T>(&mut conn))
            .await
            .map_err(|_| Error::Timeout(format!("Redis {name} timed out")))?
            .map_err(|e| Error::Store(format!("Redis {name} failed: {e}")))
    }
}

#[async_trait]
impl RegistryStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        self.query::<String>("PING", &redis::cmd("PING")).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut cmd = redis::cmd("SETEX");
        cmd.arg(key).arg(ttl.as_secs().max(1)).arg(value);
        self.query::<()>("SETEX", &cmd).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query("GET", &cmd).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.query::<()>("DEL", &cmd).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        // SCAN instead of KEYS so large keyspaces don't block the server
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(SCAN_COUNT);
            let (next, batch): (u64, Vec<String>) = self.query("SCAN", &cmd).await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<()> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(set).arg(member);
        self.query::<()>("SADD", &cmd).await
    }

    async fn srem(&self, set: &str, member: &str) -> Result<()> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(set).arg(member);
        self.query::<()>("SREM", &cmd).await
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(set);
        self.query("SMEMBERS", &cmd).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, (String, Instant)>,
    sets: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    fn purge_expired(&mut self, now: Instant) {
        self.values.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// In-process registry store with TTL expiry
///
/// Expiry uses tokio's clock, so paused-time tests can advance past a TTL.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, simulating an unreachable store
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining time to live of a key, `None` when absent or expired
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .values
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(_, expires_at)| *expires_at - now)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::Store("store unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_online()?;
        let expires_at = Instant::now() + ttl;
        self.state
            .lock()
            .values
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        Ok(state.values.get(key).map(|(value, _)| value.clone()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.check_online()?;
        self.state.lock().values.remove(key);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        let mut keys: Vec<String> = state
            .values
            .keys()
            .filter(|key| matches_pattern(key, pattern))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<()> {
        self.check_online()?;
        self.state
            .lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        if let Some(members) = state.sets.get_mut(set) {
            members.remove(member);
            if members.is_empty() {
                state.sets.remove(set);
            }
        }
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        self.check_online()?;
        let state = self.state.lock();
        let mut members: Vec<String> = state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }
}
