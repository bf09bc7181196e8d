//! Rate limiting logic and state management.

pub mod clock;
mod counter;
mod decision;
mod identity;
mod limiter;
pub mod locks;
mod logger;
mod policy;
mod policy_store;
mod store;

#[cfg(feature = "redis-store")]
mod redis_store;

/// Controllable test doubles, available to tests and with the
/// `test-helpers` feature.
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;

pub use clock::{Clock, SystemClock};
pub use counter::{ThrottleCounter, TimeWindow};
pub use decision::{Decision, Throttled};
pub use identity::{normalize_endpoint, RequestIdentity, ANONYMOUS_CLIENT};
pub use limiter::{compute_throttle_key, RateLimiter};
pub use locks::CounterLocks;
pub use logger::{ThrottleLogEntry, ThrottleLogger, TracingThrottleLogger};
pub use policy::{
    MatchedRules, PolicyProvider, PolicyRule, PolicySettings, PolicyType, PolicyWhitelist, RateLimitPolicy,
    RateLimits, RecordPolicyProvider,
};
pub use policy_store::{MemoryPolicyStore, PolicyManager, PolicyStore};
pub use store::{CounterStore, MemoryCounterStore};

#[cfg(feature = "redis-store")]
pub use redis_store::RedisCounterStore;
