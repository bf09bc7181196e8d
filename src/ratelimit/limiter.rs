//! Core rate limiter implementation.

use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{ThrottleCounter, TimeWindow};
use super::decision::{Decision, Throttled};
use super::identity::RequestIdentity;
use super::locks::CounterLocks;
use super::logger::{ThrottleLogEntry, ThrottleLogger, TracingThrottleLogger};
use super::policy::RateLimitPolicy;
use super::policy_store::PolicyManager;
use super::store::{CounterStore, MemoryCounterStore};
use crate::config::{KeyConfig, TurnstileConfig};
use crate::error::Result;
use crate::net::parse_ip;

/// Derive the store key for one identity and window.
///
/// The key is `"{prefix}:{digest}"`, where the digest is a URL-safe base64
/// SHA-256 over the window name and the identity fields of the enabled scopes.
/// Every field is tagged and length-prefixed, so distinct identities cannot
/// produce the same input. The client address is canonicalized first, so
/// `1.2.3.4` and `1.2.3.4:5000` share a counter.
pub fn compute_throttle_key(
    prefix: &str,
    identity: &RequestIdentity,
    policy: &RateLimitPolicy,
    window: TimeWindow,
) -> String {
    fn field(hasher: &mut Sha256, tag: u8, value: &str) {
        hasher.update([tag]);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    }

    let mut hasher = Sha256::new();
    field(&mut hasher, b'p', prefix);

    if policy.ip_throttling {
        field(&mut hasher, b'i', &parse_ip(&identity.client_ip).to_string());
    }
    if policy.client_throttling {
        field(&mut hasher, b'c', &identity.client_key);
    }
    if policy.endpoint_throttling {
        field(&mut hasher, b'e', &identity.endpoint);
    }
    field(&mut hasher, b'w', window.name());

    let digest = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize());
    format!("{}:{}", prefix, digest)
}

/// The rate limiter that evaluates requests against a policy.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Counting goes through [`CounterStore::increment`]. Stores that increment
/// atomically may be shared by several limiters; for other stores, updates
/// to the same key are serialized through [`CounterLocks`].
#[derive(Debug)]
pub struct RateLimiter {
    /// Counter storage
    store: Arc<dyn CounterStore>,
    /// Per-key serialization for stores without an atomic increment
    locks: CounterLocks,
    /// Time source for windows and retry hints
    clock: Arc<dyn Clock>,
    /// Receives blocked requests
    logger: Option<Arc<dyn ThrottleLogger>>,
    /// Prefix for every throttle key
    key_prefix: String,
    /// Evaluations that failed open because the store errored
    store_failures: AtomicU64,
}

impl RateLimiter {
    /// Create a rate limiter with an in-memory store and default settings.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryCounterStore::new()))
    }

    /// Create a rate limiter over `store` with default settings.
    pub fn with_store(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            locks: CounterLocks::default(),
            clock: Arc::new(SystemClock::new()),
            logger: Some(Arc::new(TracingThrottleLogger)),
            key_prefix: KeyConfig::default().throttle_prefix(),
            store_failures: AtomicU64::new(0),
        }
    }

    /// Create a rate limiter with an in-memory store, both reading `clock`.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::with_store(Arc::new(MemoryCounterStore::with_clock(clock.clone()))).clock(clock)
    }

    /// Create a rate limiter over `store` using the key and lock settings
    /// from `config`.
    pub fn from_config(config: &TurnstileConfig, store: Arc<dyn CounterStore>) -> Self {
        Self::with_store(store)
            .key_prefix(config.keys.throttle_prefix())
            .lock_shards(config.limiter.lock_shards)
    }

    /// Use `clock` for window arithmetic.
    ///
    /// A store built separately keeps its own clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Report blocked requests to `logger`, or to nobody with `None`.
    pub fn logger(mut self, logger: Option<Arc<dyn ThrottleLogger>>) -> Self {
        self.logger = logger;
        self
    }

    /// Set the throttle key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the number of lock shards used for stores without an atomic
    /// increment; 1 serializes all their counter updates.
    pub fn lock_shards(mut self, shards: usize) -> Self {
        self.locks = CounterLocks::new(shards);
        self
    }

    /// Evaluate a request, failing open if the counter store errors.
    ///
    /// A missing policy, or one with every scope switched off, allows all
    /// requests. Store failures are logged and counted in
    /// [`store_failures`](Self::store_failures).
    pub async fn evaluate(&self, identity: &RequestIdentity, policy: Option<&RateLimitPolicy>) -> Decision {
        match self.try_evaluate(identity, policy).await {
            Ok(decision) => decision,
            Err(e) => {
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %e,
                    client_ip = %identity.client_ip,
                    endpoint = %identity.endpoint,
                    "Counter store failed, allowing request"
                );
                Decision::Allowed
            }
        }
    }

    /// Evaluate a request against the policy currently held by `policies`.
    ///
    /// The policy is fetched once, so a concurrent update does not affect
    /// this evaluation.
    pub async fn evaluate_current(&self, identity: &RequestIdentity, policies: &PolicyManager) -> Decision {
        let policy = policies.current();
        self.evaluate(identity, policy.as_deref()).await
    }

    /// Evaluate a request, returning counter store errors to the caller.
    pub async fn try_evaluate(
        &self,
        identity: &RequestIdentity,
        policy: Option<&RateLimitPolicy>,
    ) -> Result<Decision> {
        let Some(policy) = policy.filter(|p| p.is_enabled()) else {
            trace!("No active throttling policy");
            return Ok(Decision::Allowed);
        };

        if policy.is_whitelisted(identity) {
            trace!(identity = %identity, "Request is whitelisted");
            return Ok(Decision::Allowed);
        }

        let rules = policy.matched_rules(identity);

        for (window, default_limit) in policy.rates_with_defaults() {
            let limit = rules.apply(window, default_limit);
            if limit == 0 {
                continue;
            }

            let key = self.throttle_key(identity, policy, window);
            let counter = self.process_request(&key, window).await?;

            trace!(
                key = %key,
                window = %window,
                count = counter.total_requests,
                limit = limit,
                "Checked rate limit window"
            );

            if counter.total_requests > limit {
                let now = self.clock.now();
                let throttled = Throttled {
                    limit,
                    window,
                    retry_after_secs: window.retry_after(counter.window_start, now),
                    total_requests: counter.total_requests,
                    window_start: counter.window_start,
                };

                if let Some(logger) = &self.logger {
                    logger.log(&ThrottleLogEntry {
                        request_id: key,
                        client_ip: identity.client_ip.clone(),
                        client_key: identity.client_key.clone(),
                        endpoint: identity.endpoint.clone(),
                        total_requests: counter.total_requests,
                        start_period: counter.window_start,
                        rate_limit: limit,
                        rate_limit_period: window,
                        log_date: now,
                    });
                }

                return Ok(Decision::Blocked(throttled));
            }
        }

        Ok(Decision::Allowed)
    }

    /// Check whether an identity bypasses throttling under `policy`.
    pub fn is_whitelisted(identity: &RequestIdentity, policy: &RateLimitPolicy) -> bool {
        policy.is_whitelisted(identity)
    }

    /// Resolve the effective limit for `window`, starting from `limit`.
    pub fn apply_rules(
        identity: &RequestIdentity,
        policy: &RateLimitPolicy,
        window: TimeWindow,
        limit: u64,
    ) -> u64 {
        policy.matched_rules(identity).apply(window, limit)
    }

    /// Derive the store key for an identity and window.
    pub fn throttle_key(&self, identity: &RequestIdentity, policy: &RateLimitPolicy, window: TimeWindow) -> String {
        compute_throttle_key(&self.key_prefix, identity, policy, window)
    }

    /// Seconds a caller blocked in `window` should wait.
    pub fn retry_after(&self, window_start: DateTime<Utc>, window: TimeWindow) -> u64 {
        window.retry_after(window_start, self.clock.now())
    }

    /// Count one request against `key` and return the updated counter.
    ///
    /// Starts a new window when no live counter exists; otherwise increments
    /// it, keeping its original start. Stores without an atomic increment
    /// are serialized per key through this limiter's locks.
    pub async fn process_request(&self, key: &str, window: TimeWindow) -> Result<ThrottleCounter> {
        let counter = if self.store.atomic_increment() {
            self.store.increment(key, window.duration(), self.clock.now()).await?
        } else {
            let _guard = self.locks.lock(key).await;
            self.store.increment(key, window.duration(), self.clock.now()).await?
        };

        if counter.total_requests == 1 {
            debug!(key = %key, window = %window, "Starting new throttle window");
        }
        Ok(counter)
    }

    /// Get the live counter for an identity and window.
    ///
    /// Returns `None` if no request has been counted in the current window.
    pub async fn counter(
        &self,
        identity: &RequestIdentity,
        policy: &RateLimitPolicy,
        window: TimeWindow,
    ) -> Result<Option<ThrottleCounter>> {
        let key = self.throttle_key(identity, policy, window);
        let now = self.clock.now();
        Ok(self
            .store
            .get(&key)
            .await?
            .filter(|c| !c.is_expired(window.span(), now)))
    }

    /// Clear all counters.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Number of evaluations that failed open.
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
