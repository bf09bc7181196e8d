//! Storage and hot replacement of the active policy.
//!
//! Policies are handed out as `Arc`s. An update swaps the stored `Arc`, so
//! an evaluation that already fetched the old policy keeps using it
//! unchanged.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

use super::policy::{PolicyProvider, RateLimitPolicy};
use crate::config::KeyConfig;
use crate::error::Result;

/// Keyed storage for policies.
pub trait PolicyStore: Send + Sync + Debug {
    /// Get the policy stored under `key`.
    fn get(&self, key: &str) -> Option<Arc<RateLimitPolicy>>;

    /// Store `policy` under `key`, replacing any previous one.
    fn put(&self, key: &str, policy: Arc<RateLimitPolicy>);

    /// Remove the policy stored under `key`.
    fn remove(&self, key: &str);
}

/// In-process policy store.
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    policies: RwLock<HashMap<String, Arc<RateLimitPolicy>>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn get(&self, key: &str) -> Option<Arc<RateLimitPolicy>> {
        self.policies.read().get(key).cloned()
    }

    fn put(&self, key: &str, policy: Arc<RateLimitPolicy>) {
        self.policies.write().insert(key.to_string(), policy);
    }

    fn remove(&self, key: &str) {
        self.policies.write().remove(key);
    }
}

/// Reads and replaces the active policy under the configured policy key.
#[derive(Debug, Clone)]
pub struct PolicyManager {
    store: Arc<dyn PolicyStore>,
    key: String,
}

impl PolicyManager {
    /// Create a manager using the policy key from `keys`.
    pub fn new(store: Arc<dyn PolicyStore>, keys: &KeyConfig) -> Self {
        Self {
            store,
            key: keys.policy_key(),
        }
    }

    /// The currently active policy, if one has been stored.
    pub fn current(&self) -> Option<Arc<RateLimitPolicy>> {
        self.store.get(&self.key)
    }

    /// Replace the active policy.
    ///
    /// The policy's IP patterns are compiled here, before it is published.
    pub fn update_policy(&self, policy: RateLimitPolicy) {
        policy.compile();
        info!(
            key = %self.key,
            ip_throttling = policy.ip_throttling,
            client_throttling = policy.client_throttling,
            endpoint_throttling = policy.endpoint_throttling,
            "Updating rate limit policy"
        );
        self.store.put(&self.key, Arc::new(policy));
    }

    /// Rebuild the active policy from a provider.
    ///
    /// On error the previous policy stays in place.
    pub fn reload<P: PolicyProvider + ?Sized>(&self, provider: &P) -> Result<()> {
        let policy = RateLimitPolicy::from_provider(provider)?;
        self.update_policy(policy);
        Ok(())
    }

    /// Remove the active policy, which disables throttling.
    pub fn clear(&self) {
        info!(key = %self.key, "Removing rate limit policy");
        self.store.remove(&self.key);
    }

    /// The key the policy is stored under.
    pub fn key(&self) -> &str {
        &self.key
    }
}
