//! Redis-backed counter store.
//!
//! Each counter is a hash under its throttle key holding the window start
//! (`start`, Unix milliseconds) and the request count (`count`). The key
//! expires when its window ends, so Redis drops dead counters on its own.
//! Increments run as a server-side script, which keeps them atomic across
//! every limiter and process sharing the server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::counter::ThrottleCounter;
use super::store::{ttl_delta, CounterStore};
use crate::error::{Result, TurnstileError};

/// Restart the window if it is missing or over, otherwise count one more.
///
/// KEYS[1] is the counter, ARGV[1] the caller's time and ARGV[2] the window
/// length, both in milliseconds. Returns `{start, count}`.
const INCREMENT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local start = tonumber(redis.call('HGET', KEYS[1], 'start'))
if start and start + ttl >= now then
  local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
  return {start, count}
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'start', now, 'count', 1)
redis.call('PEXPIRE', KEYS[1], ttl)
return {now, 1}
"#;

/// Counter store shared through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    /// Keys matching `{prefix}:*` belong to this store
    prefix: String,
    clock: Arc<dyn Clock>,
    increment_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis at `url`, owning the keys under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        let prefix = prefix.into();
        debug!(url = %url, prefix = %prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            prefix,
            clock: Arc::new(SystemClock::new()),
            increment_script: Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Use `clock` to compute remaining TTLs.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

fn window_start(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| TurnstileError::Store(format!("counter start out of range: {}", millis)))
}

fn millis(ttl: Duration) -> Result<i64> {
    i64::try_from(ttl.as_millis()).map_err(|_| TurnstileError::Store(format!("counter TTL too large: {:?}", ttl)))
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<ThrottleCounter>> {
        let mut conn = self.connection.clone();
        let (start, count): (Option<i64>, Option<u64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("start")
            .arg("count")
            .query_async(&mut conn)
            .await?;

        match (start, count) {
            (None, None) => Ok(None),
            (Some(start), Some(count)) => Ok(Some(ThrottleCounter {
                window_start: window_start(start)?,
                total_requests: count,
            })),
            _ => {
                warn!(key = %key, "Discarding incomplete counter");
                let _: () = conn.del(key).await?;
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, counter: ThrottleCounter, ttl: Duration) -> Result<()> {
        let remaining = (counter.expires_at(ttl_delta(ttl)?) - self.clock.now()).num_milliseconds();
        let mut conn = self.connection.clone();

        if remaining <= 0 {
            let _: () = conn.del(key).await?;
            return Ok(());
        }

        let count = i64::try_from(counter.total_requests).unwrap_or(i64::MAX);
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(key)
            .ignore()
            .cmd("HSET")
            .arg(key)
            .arg("start")
            .arg(counter.window_start.timestamp_millis())
            .arg("count")
            .arg(count)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(remaining)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let pattern = format!("{}:*", self.prefix);
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                let _: () = conn.del(&keys).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %self.prefix, removed = removed, "Cleared Redis counters");
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<ThrottleCounter> {
        let mut conn = self.connection.clone();
        let (start, count): (i64, u64) = self
            .increment_script
            .key(key)
            .arg(now.timestamp_millis())
            .arg(millis(ttl)?)
            .invoke_async(&mut conn)
            .await?;

        Ok(ThrottleCounter {
            window_start: window_start(start)?,
            total_requests: count,
        })
    }

    fn atomic_increment(&self) -> bool {
        true
    }
}
