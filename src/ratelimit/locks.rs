//! Serialization of counter read-modify-write cycles.

use std::fmt;
use std::hash::BuildHasher;
use tokio::sync::{Mutex, MutexGuard};

/// Default number of lock shards.
pub const DEFAULT_LOCK_SHARDS: usize = 64;

/// A fixed set of async mutexes selected by key hash.
///
/// Requests for the same key always take the same mutex, so their
/// read-modify-write cycles never interleave. With a single shard this
/// degrades to one global lock.
pub struct CounterLocks {
    shards: Box<[Mutex<()>]>,
    hasher: ahash::RandomState,
}

impl CounterLocks {
    /// Create `shards` locks; zero is treated as one.
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            shards,
            hasher: ahash::RandomState::new(),
        }
    }

    /// A single lock shared by every key.
    pub fn global() -> Self {
        Self::new(1)
    }

    /// Wait for the lock guarding `key`.
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(key)].lock().await
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }
}

impl Default for CounterLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_SHARDS)
    }
}

impl fmt::Debug for CounterLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterLocks")
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_shards_becomes_global() {
        assert_eq!(CounterLocks::new(0).shard_count(), 1);
        assert_eq!(CounterLocks::global().shard_count(), 1);
        assert_eq!(CounterLocks::default().shard_count(), DEFAULT_LOCK_SHARDS);
    }

    #[test]
    fn test_same_key_same_shard() {
        let locks = CounterLocks::new(16);
        assert_eq!(locks.shard_index("throttle:abc"), locks.shard_index("throttle:abc"));
        assert!(locks.shard_index("anything") < 16);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_key() {
        let locks = CounterLocks::global();
        let guard = locks.lock("a").await;
        assert!(locks.shards[0].try_lock().is_err());
        drop(guard);
        assert!(locks.shards[0].try_lock().is_ok());
    }
}
