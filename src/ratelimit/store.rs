//! Counter storage.
//!
//! A [`CounterStore`] keeps one [`ThrottleCounter`] per derived throttle key.
//! Entries carry a time-to-live measured from the counter's `window_start`;
//! once it has passed the entry reads as absent. There is no background
//! sweeper, expiry is checked when an entry is read.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::counter::ThrottleCounter;
use crate::error::{Result, TurnstileError};

/// Storage for throttle counters.
///
/// The limiter counts requests through [`increment`](CounterStore::increment).
/// Stores that perform it atomically per key report so through
/// [`atomic_increment`](CounterStore::atomic_increment), and are then safe to
/// share between limiters and processes. Other stores get the default
/// read-then-write increment, which each limiter serializes with its own
/// [`CounterLocks`](super::locks::CounterLocks).
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Get the live counter for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<ThrottleCounter>>;

    /// Insert or replace the counter for `key`.
    ///
    /// The entry expires `ttl` after `counter.window_start`.
    async fn put(&self, key: &str, counter: ThrottleCounter, ttl: Duration) -> Result<()>;

    /// Remove the counter for `key`.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every throttle counter held by this store.
    ///
    /// Stores sharing a backend with other data must leave that data alone.
    async fn clear(&self) -> Result<()>;

    /// Whether a live counter exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Count one request against `key` and return the updated counter.
    ///
    /// A missing counter, or one whose `ttl` ran out before `now`, restarts at
    /// one with `window_start = now`. Otherwise the count goes up by one and
    /// the original start is kept.
    async fn increment(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<ThrottleCounter> {
        let span = ttl_delta(ttl)?;
        let counter = match self.get(key).await? {
            Some(existing) if !existing.is_expired(span, now) => existing.incremented(),
            _ => ThrottleCounter::start(now),
        };
        self.put(key, counter, ttl).await?;
        Ok(counter)
    }

    /// Whether [`increment`](Self::increment) is atomic per key for every
    /// user of the store.
    fn atomic_increment(&self) -> bool {
        false
    }
}

pub(crate) fn ttl_delta(ttl: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(ttl).map_err(|e| TurnstileError::Store(format!("invalid counter TTL: {}", e)))
}

#[derive(Debug, Clone, Copy)]
struct StoredCounter {
    counter: ThrottleCounter,
    ttl: TimeDelta,
}

/// In-process counter store backed by DashMap.
///
/// DashMap shards its locks internally, so unrelated keys do not contend.
/// Increments run under the shard lock of their key and are atomic.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, StoredCounter>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters
            .retain(|_, stored| !stored.counter.is_expired(stored.ttl, now));
        let purged = before.saturating_sub(self.counters.len());
        if purged > 0 {
            trace!(purged, "Purged expired throttle counters");
        }
        purged
    }

    /// Number of entries, including expired ones not yet read or purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<ThrottleCounter>> {
        let now = self.clock.now();

        // The read guard must be released before removing the entry.
        match self.counters.get(key) {
            None => return Ok(None),
            Some(stored) if !stored.counter.is_expired(stored.ttl, now) => {
                return Ok(Some(stored.counter));
            }
            Some(_) => {}
        }

        self.counters
            .remove_if(key, |_, stored| stored.counter.is_expired(stored.ttl, now));
        Ok(None)
    }

    async fn put(&self, key: &str, counter: ThrottleCounter, ttl: Duration) -> Result<()> {
        let ttl = ttl_delta(ttl)?;
        self.counters.insert(key.to_string(), StoredCounter { counter, ttl });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.counters.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.counters.clear();
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<ThrottleCounter> {
        let ttl = ttl_delta(ttl)?;

        let counter = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let stored = entry.get_mut();
                stored.counter = if stored.counter.is_expired(ttl, now) {
                    ThrottleCounter::start(now)
                } else {
                    stored.counter.incremented()
                };
                stored.ttl = ttl;
                stored.counter
            }
            Entry::Vacant(entry) => {
                let counter = ThrottleCounter::start(now);
                entry.insert(StoredCounter { counter, ttl });
                counter
            }
        };

        Ok(counter)
    }

    fn atomic_increment(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::mocks::ManualClock;
    use chrono::Utc;

    fn store_with_clock() -> (MemoryCounterStore, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let store = MemoryCounterStore::with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, clock) = store_with_clock();
        let counter = ThrottleCounter::start(clock.now());

        store.put("k", counter, Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(counter));
        assert!(store.exists("k").await.unwrap());
        assert!(!store.exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_entry_expires_from_window_start() {
        let (store, clock) = store_with_clock();
        let counter = ThrottleCounter::start(clock.now());
        store.put("k", counter, Duration::from_secs(60)).await.unwrap();

        clock.advance(TimeDelta::seconds(60));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(TimeDelta::seconds(1));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (store, clock) = store_with_clock();
        let counter = ThrottleCounter::start(clock.now());
        store.put("a", counter, Duration::from_secs(1)).await.unwrap();
        store.put("b", counter, Duration::from_secs(1)).await.unwrap();
        store.put("c", counter, Duration::from_secs(1)).await.unwrap();

        store.remove("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
        assert_eq!(store.len(), 2);

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();
        store
            .put("short", ThrottleCounter::start(clock.now()), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .put("long", ThrottleCounter::start(clock.now()), Duration::from_secs(3600))
            .await
            .unwrap();

        clock.advance(TimeDelta::seconds(5));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.exists("long").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_starts_and_extends_window() {
        let (store, clock) = store_with_clock();
        let start = clock.now();

        let first = store.increment("k", Duration::from_secs(60), start).await.unwrap();
        assert_eq!(first, ThrottleCounter::start(start));

        clock.advance(TimeDelta::seconds(30));
        let second = store.increment("k", Duration::from_secs(60), clock.now()).await.unwrap();
        assert_eq!(second.total_requests, 2);
        assert_eq!(second.window_start, start);
        assert_eq!(store.get("k").await.unwrap(), Some(second));
        assert!(store.atomic_increment());
    }

    #[tokio::test]
    async fn test_increment_restarts_expired_window() {
        let (store, clock) = store_with_clock();
        let stale = ThrottleCounter {
            window_start: clock.now() - TimeDelta::seconds(120),
            total_requests: 50,
        };
        store.put("k", stale, Duration::from_secs(3600)).await.unwrap();

        let counter = store.increment("k", Duration::from_secs(60), clock.now()).await.unwrap();
        assert_eq!(counter.total_requests, 1);
        assert_eq!(counter.window_start, clock.now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_atomic() {
        let (store, clock) = store_with_clock();
        let store = Arc::new(store);
        let now = clock.now();

        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("k", Duration::from_secs(60), now).await })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.get("k").await.unwrap().unwrap().total_requests, 1000);
    }

    #[test]
    fn test_store_usable_outside_async_context() {
        let store = MemoryCounterStore::new();
        let counter = ThrottleCounter::start(Utc::now());
        tokio_test::block_on(store.put("k", counter, Duration::from_secs(10))).unwrap();
        assert!(tokio_test::block_on(store.exists("k")).unwrap());
    }
}
