//! Rate limit policy configuration and rule matching.
//!
//! A policy carries default limits per window, three independently switchable
//! scopes (IP, client, endpoint), per-scope override rules and whitelists.
//! Overrides are resolved from least to most specific scope:
//! route rules, endpoint rules, client rules, then IP rules, each later scope
//! replacing the limit chosen by the earlier ones.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

use super::counter::TimeWindow;
use super::identity::RequestIdentity;
use crate::error::{Result, TurnstileError};
use crate::net::IpMatcher;

/// Per-window limits. Zero or unset means "no limit" for that window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_week: Option<u64>,
}

impl RateLimits {
    /// Limits with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit for one window.
    pub fn with_limit(mut self, window: TimeWindow, limit: u64) -> Self {
        *self.slot_mut(window) = Some(limit);
        self
    }

    /// The configured limit for `window`, `0` when unset.
    pub fn limit(&self, window: TimeWindow) -> u64 {
        match window {
            TimeWindow::Second => self.per_second,
            TimeWindow::Minute => self.per_minute,
            TimeWindow::Hour => self.per_hour,
            TimeWindow::Day => self.per_day,
            TimeWindow::Week => self.per_week,
        }
        .unwrap_or(0)
    }

    fn slot_mut(&mut self, window: TimeWindow) -> &mut Option<u64> {
        match window {
            TimeWindow::Second => &mut self.per_second,
            TimeWindow::Minute => &mut self.per_minute,
            TimeWindow::Hour => &mut self.per_hour,
            TimeWindow::Day => &mut self.per_day,
            TimeWindow::Week => &mut self.per_week,
        }
    }
}

/// A complete throttling policy.
///
/// IP whitelist and rule patterns are compiled once, by [`compile`] or on
/// first use. Edit `ip_rules` and `ip_whitelist` before that, or call
/// [`recompile`] afterwards. Clones start uncompiled.
///
/// [`compile`]: RateLimitPolicy::compile
/// [`recompile`]: RateLimitPolicy::recompile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Default limits, flattened into the policy document
    #[serde(flatten)]
    pub rates: RateLimits,

    /// Enables IP throttling
    pub ip_throttling: bool,
    /// Enables client key throttling
    pub client_throttling: bool,
    /// Enables endpoint throttling
    pub endpoint_throttling: bool,

    /// Count requests widest window first, so rejected requests still consume
    /// the wider quotas
    pub stack_blocked_requests: bool,

    /// Address, CIDR or range pattern to limits
    pub ip_rules: BTreeMap<String, RateLimits>,
    /// Exact client key to limits
    pub client_rules: BTreeMap<String, RateLimits>,
    /// Endpoint substring to limits
    pub endpoint_rules: BTreeMap<String, RateLimits>,
    /// Route identifier substring to limits, weaker than endpoint rules
    pub route_rules: BTreeMap<String, RateLimits>,

    pub ip_whitelist: BTreeSet<String>,
    pub client_whitelist: BTreeSet<String>,
    pub endpoint_whitelist: BTreeSet<String>,

    #[serde(skip)]
    pub(crate) ip_matchers: IpMatcherCache,
}

/// Compiled IP patterns of one policy.
#[derive(Debug)]
struct CompiledIpPatterns {
    whitelist: IpMatcher,
    rules: IpMatcher,
}

/// Lazily filled slot for [`CompiledIpPatterns`].
///
/// Cloning yields an empty slot and equality ignores it, so the cache never
/// outlives the patterns it was built from through a clone.
#[derive(Debug, Default)]
pub(crate) struct IpMatcherCache(OnceLock<CompiledIpPatterns>);

impl IpMatcherCache {
    pub(crate) fn is_compiled(&self) -> bool {
        self.0.get().is_some()
    }
}

impl Clone for IpMatcherCache {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl PartialEq for IpMatcherCache {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl RateLimitPolicy {
    /// Create a policy with the given default limits and every scope off.
    pub fn new(rates: RateLimits) -> Self {
        Self {
            rates,
            ..Self::default()
        }
    }

    /// Load a policy from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Policy(format!("Failed to parse rate limit policy: {}", e)))
    }

    /// Compile the IP whitelist and rule patterns if not done yet.
    pub fn compile(&self) {
        self.compiled_ip_patterns();
    }

    /// Discard and rebuild the compiled IP patterns after editing them.
    pub fn recompile(&mut self) {
        self.ip_matchers = IpMatcherCache::default();
        self.compile();
    }

    fn compiled_ip_patterns(&self) -> &CompiledIpPatterns {
        self.ip_matchers.0.get_or_init(|| CompiledIpPatterns {
            whitelist: IpMatcher::new(&self.ip_whitelist),
            rules: IpMatcher::new(self.ip_rules.keys()),
        })
    }

    /// Whether any scope is switched on.
    pub fn is_enabled(&self) -> bool {
        self.ip_throttling || self.client_throttling || self.endpoint_throttling
    }

    /// Default limits for every window, narrowest first.
    ///
    /// Windows without a default get an explicit zero, which never blocks
    /// unless a rule overrides it. The order is reversed when blocked
    /// requests stack.
    pub fn rates_with_defaults(&self) -> Vec<(TimeWindow, u64)> {
        let mut rates: Vec<(TimeWindow, u64)> = TimeWindow::ALL
            .iter()
            .map(|&window| (window, self.rates.limit(window)))
            .collect();

        if self.stack_blocked_requests {
            rates.reverse();
        }
        rates
    }

    /// Check whether an identity is exempt from throttling.
    ///
    /// A whitelist only applies when its scope is enabled. Client keys match
    /// exactly, endpoints by case-insensitive substring, IPs through
    /// [`IpMatcher`].
    pub fn is_whitelisted(&self, identity: &RequestIdentity) -> bool {
        if identity.force_whitelist {
            return true;
        }

        if self.ip_throttling
            && !self.ip_whitelist.is_empty()
            && self.compiled_ip_patterns().whitelist.contains(&identity.client_ip)
        {
            return true;
        }

        if self.client_throttling && self.client_whitelist.contains(&identity.client_key) {
            return true;
        }

        self.endpoint_throttling
            && self
                .endpoint_whitelist
                .iter()
                .any(|pattern| contains_ignore_case(&identity.endpoint, pattern))
    }

    /// Collect the rules that apply to `identity`.
    ///
    /// The result is computed once per evaluation and then queried per window.
    pub fn matched_rules(&self, identity: &RequestIdentity) -> MatchedRules<'_> {
        let mut matched = MatchedRules::default();

        if self.endpoint_throttling {
            matched.route = substring_matches(&self.route_rules, &identity.endpoint);
            matched.endpoint = substring_matches(&self.endpoint_rules, &identity.endpoint);
        }

        if self.client_throttling {
            matched.client = self.client_rules.get(&identity.client_key);
        }

        if self.ip_throttling && !self.ip_rules.is_empty() {
            matched.ip = self
                .compiled_ip_patterns()
                .rules
                .matching_rules(&identity.client_ip)
                .into_iter()
                .filter_map(|pattern| self.ip_rules.get(pattern))
                .collect();
        }

        matched
    }

    /// Effective limit for `identity` in `window`, starting from the default.
    pub fn find_limit(&self, identity: &RequestIdentity, window: TimeWindow) -> u64 {
        self.matched_rules(identity).apply(window, self.rates.limit(window))
    }

    /// Build a policy from a provider's settings, rules and whitelists.
    pub fn from_provider<P: PolicyProvider + ?Sized>(provider: &P) -> Result<Self> {
        let settings = provider.read_settings()?;
        let mut policy = RateLimitPolicy {
            rates: settings.limits,
            ip_throttling: settings.ip_throttling,
            client_throttling: settings.client_throttling,
            endpoint_throttling: settings.endpoint_throttling,
            stack_blocked_requests: settings.stack_blocked_requests,
            ..Self::default()
        };

        for rule in provider.all_rules()? {
            let rules = match rule.policy_type {
                PolicyType::IpThrottling => &mut policy.ip_rules,
                PolicyType::ClientThrottling => &mut policy.client_rules,
                PolicyType::EndpointThrottling => &mut policy.endpoint_rules,
            };
            rules.insert(rule.entry, rule.limits);
        }

        for entry in provider.all_whitelists()? {
            let whitelist = match entry.policy_type {
                PolicyType::IpThrottling => &mut policy.ip_whitelist,
                PolicyType::ClientThrottling => &mut policy.client_whitelist,
                PolicyType::EndpointThrottling => &mut policy.endpoint_whitelist,
            };
            whitelist.insert(entry.entry);
        }

        Ok(policy)
    }
}

/// Rules from a policy that match one identity.
#[derive(Debug, Clone, Default)]
pub struct MatchedRules<'a> {
    route: Vec<&'a RateLimits>,
    endpoint: Vec<&'a RateLimits>,
    client: Option<&'a RateLimits>,
    /// Narrowest range first
    ip: Vec<&'a RateLimits>,
}

impl MatchedRules<'_> {
    /// Resolve the limit for `window`.
    ///
    /// Route and endpoint scopes contribute the smallest nonzero limit among
    /// their matches. A nonzero client rule then overrides, and a nonzero IP
    /// rule overrides everything.
    pub fn apply(&self, window: TimeWindow, default: u64) -> u64 {
        let mut limit = default;

        for scope in [&self.route, &self.endpoint] {
            if let Some(min) = scope.iter().map(|r| r.limit(window)).filter(|&l| l > 0).min() {
                limit = min;
            }
        }

        if let Some(client) = self.client.map(|r| r.limit(window)).filter(|&l| l > 0) {
            limit = client;
        }

        if let Some(ip) = self.ip.iter().map(|r| r.limit(window)).find(|&l| l > 0) {
            limit = ip;
        }

        limit
    }

    /// Whether no rule matched at all.
    pub fn is_empty(&self) -> bool {
        self.route.is_empty() && self.endpoint.is_empty() && self.client.is_none() && self.ip.is_empty()
    }
}

fn substring_matches<'a>(rules: &'a BTreeMap<String, RateLimits>, endpoint: &str) -> Vec<&'a RateLimits> {
    rules
        .iter()
        .filter(|(pattern, _)| contains_ignore_case(endpoint, pattern))
        .map(|(_, limits)| limits)
        .collect()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Scope a stored rule or whitelist entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    IpThrottling,
    ClientThrottling,
    EndpointThrottling,
}

/// Global settings read from a policy provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    #[serde(flatten)]
    pub limits: RateLimits,
    pub ip_throttling: bool,
    pub client_throttling: bool,
    pub endpoint_throttling: bool,
    pub stack_blocked_requests: bool,
}

/// One override rule as stored by a policy provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub entry: String,
    pub policy_type: PolicyType,
    #[serde(flatten)]
    pub limits: RateLimits,
}

/// One whitelist entry as stored by a policy provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyWhitelist {
    pub entry: String,
    pub policy_type: PolicyType,
}

/// A persistent source of policy records, such as a database table.
pub trait PolicyProvider: Send + Sync {
    /// Read the global settings.
    fn read_settings(&self) -> Result<PolicySettings>;

    /// Read every override rule.
    fn all_rules(&self) -> Result<Vec<PolicyRule>>;

    /// Read every whitelist entry.
    fn all_whitelists(&self) -> Result<Vec<PolicyWhitelist>>;
}

/// A provider holding its records in memory, loadable from YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordPolicyProvider {
    pub settings: PolicySettings,
    pub rules: Vec<PolicyRule>,
    pub whitelists: Vec<PolicyWhitelist>,
}

impl RecordPolicyProvider {
    /// Load provider records from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Policy(format!("Failed to parse policy records: {}", e)))
    }
}

impl PolicyProvider for RecordPolicyProvider {
    fn read_settings(&self) -> Result<PolicySettings> {
        Ok(self.settings.clone())
    }

    fn all_rules(&self) -> Result<Vec<PolicyRule>> {
        Ok(self.rules.clone())
    }

    fn all_whitelists(&self) -> Result<Vec<PolicyWhitelist>> {
        Ok(self.whitelists.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(ip: &str, key: &str, endpoint: &str) -> RequestIdentity {
        RequestIdentity::new(ip, Some(key), endpoint)
    }

    fn all_scopes() -> RateLimitPolicy {
        RateLimitPolicy {
            ip_throttling: true,
            client_throttling: true,
            endpoint_throttling: true,
            ..RateLimitPolicy::default()
        }
    }

    #[test]
    fn test_parse_policy_yaml() {
        let yaml = r#"
per_second: 5
per_minute: 100
ip_throttling: true
endpoint_throttling: true
stack_blocked_requests: true
ip_rules:
  "10.0.0.0/8":
    per_second: 50
endpoint_rules:
  /search:
    per_minute: 10
ip_whitelist:
  - 127.0.0.1
  - "::1"
endpoint_whitelist:
  - /health
"#;
        let policy = RateLimitPolicy::from_yaml(yaml).unwrap();
        assert_eq!(policy.rates.limit(TimeWindow::Second), 5);
        assert_eq!(policy.rates.limit(TimeWindow::Minute), 100);
        assert_eq!(policy.rates.limit(TimeWindow::Hour), 0);
        assert!(policy.ip_throttling);
        assert!(!policy.client_throttling);
        assert!(policy.stack_blocked_requests);
        assert_eq!(policy.ip_rules["10.0.0.0/8"].limit(TimeWindow::Second), 50);
        assert_eq!(policy.endpoint_rules["/search"].limit(TimeWindow::Minute), 10);
        assert!(policy.ip_whitelist.contains("::1"));
        assert!(policy.endpoint_whitelist.contains("/health"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        assert!(RateLimitPolicy::from_yaml("per_second: [nope").is_err());
    }

    #[test]
    fn test_rates_with_defaults() {
        let policy = RateLimitPolicy::new(RateLimits::new().with_limit(TimeWindow::Minute, 2));
        let rates = policy.rates_with_defaults();
        assert_eq!(
            rates,
            vec![
                (TimeWindow::Second, 0),
                (TimeWindow::Minute, 2),
                (TimeWindow::Hour, 0),
                (TimeWindow::Day, 0),
                (TimeWindow::Week, 0),
            ]
        );

        let stacked = RateLimitPolicy {
            stack_blocked_requests: true,
            ..policy
        };
        let windows: Vec<TimeWindow> = stacked.rates_with_defaults().into_iter().map(|(w, _)| w).collect();
        assert_eq!(windows.first(), Some(&TimeWindow::Week));
        assert_eq!(windows.last(), Some(&TimeWindow::Second));
    }

    #[test]
    fn test_whitelists_respect_scope_switches() {
        let mut policy = RateLimitPolicy::default();
        policy.ip_whitelist.insert("10.0.0.0/8".to_string());
        policy.client_whitelist.insert("trusted".to_string());
        policy.endpoint_whitelist.insert("/Health".to_string());

        let id = identity("10.1.1.1", "trusted", "/health/live");
        assert!(!policy.is_whitelisted(&id));

        policy.ip_throttling = true;
        assert!(policy.is_whitelisted(&id));
        assert!(!policy.is_whitelisted(&identity("8.8.8.8", "other", "/a")));

        policy.client_throttling = true;
        assert!(policy.is_whitelisted(&identity("8.8.8.8", "trusted", "/a")));
        assert!(!policy.is_whitelisted(&identity("8.8.8.8", "Trusted", "/a")));

        policy.endpoint_throttling = true;
        assert!(policy.is_whitelisted(&identity("8.8.8.8", "other", "/HEALTH")));
    }

    #[test]
    fn test_force_whitelist() {
        let policy = all_scopes();
        let id = identity("1.2.3.4", "k", "/a").with_force_whitelist(true);
        assert!(policy.is_whitelisted(&id));
    }

    #[test]
    fn test_endpoint_rules_take_minimum() {
        let mut policy = all_scopes();
        policy.rates = RateLimits::new().with_limit(TimeWindow::Second, 100);
        policy.endpoint_rules.insert("/api".into(), RateLimits::new().with_limit(TimeWindow::Second, 20));
        policy.endpoint_rules.insert("/api/search".into(), RateLimits::new().with_limit(TimeWindow::Second, 5));
        policy.endpoint_rules.insert("/api/se".into(), RateLimits::new().with_limit(TimeWindow::Minute, 7));

        let id = identity("1.1.1.1", "k", "/api/search");
        assert_eq!(policy.find_limit(&id, TimeWindow::Second), 5);
        assert_eq!(policy.find_limit(&id, TimeWindow::Minute), 7);
        assert_eq!(policy.find_limit(&id, TimeWindow::Hour), 0);
        assert_eq!(policy.find_limit(&identity("1.1.1.1", "k", "/other"), TimeWindow::Second), 100);
    }

    #[test]
    fn test_client_overrides_endpoint() {
        let mut policy = all_scopes();
        policy.endpoint_rules.insert("/search".into(), RateLimits::new().with_limit(TimeWindow::Second, 10));
        policy.client_rules.insert("k1".into(), RateLimits::new().with_limit(TimeWindow::Second, 100));

        assert_eq!(policy.find_limit(&identity("1.1.1.1", "k1", "/search"), TimeWindow::Second), 100);
        assert_eq!(policy.find_limit(&identity("1.1.1.1", "k2", "/search"), TimeWindow::Second), 10);
    }

    #[test]
    fn test_ip_overrides_client_and_endpoint() {
        let mut policy = all_scopes();
        policy.endpoint_rules.insert("/search".into(), RateLimits::new().with_limit(TimeWindow::Second, 10));
        policy.client_rules.insert("k1".into(), RateLimits::new().with_limit(TimeWindow::Second, 100));
        policy.ip_rules.insert("10.0.0.0/8".into(), RateLimits::new().with_limit(TimeWindow::Second, 3));

        let id = identity("10.2.3.4", "k1", "/search");
        assert_eq!(policy.find_limit(&id, TimeWindow::Second), 3);
    }

    #[test]
    fn test_zero_override_does_not_replace() {
        let mut policy = all_scopes();
        policy.rates = RateLimits::new().with_limit(TimeWindow::Second, 4);
        policy.client_rules.insert("k1".into(), RateLimits::new().with_limit(TimeWindow::Second, 0));
        policy.ip_rules.insert("1.1.1.1".into(), RateLimits::new().with_limit(TimeWindow::Minute, 9));

        let id = identity("1.1.1.1", "k1", "/");
        assert_eq!(policy.find_limit(&id, TimeWindow::Second), 4);
        assert_eq!(policy.find_limit(&id, TimeWindow::Minute), 9);
    }

    #[test]
    fn test_narrowest_ip_rule_wins() {
        let mut policy = all_scopes();
        policy.ip_rules.insert("10.0.0.0/8".into(), RateLimits::new().with_limit(TimeWindow::Second, 50));
        policy.ip_rules.insert("10.1.0.0/16".into(), RateLimits::new().with_limit(TimeWindow::Second, 5));
        policy.ip_rules.insert("10.1.2.3".into(), RateLimits::new().with_limit(TimeWindow::Minute, 1));

        // The /32 has nothing for seconds, so the /16 applies.
        let id = identity("10.1.2.3", "k", "/");
        assert_eq!(policy.find_limit(&id, TimeWindow::Second), 5);
        assert_eq!(policy.find_limit(&id, TimeWindow::Minute), 1);
        assert_eq!(policy.find_limit(&identity("10.9.0.1", "k", "/"), TimeWindow::Second), 50);
    }

    #[test]
    fn test_disabled_scopes_ignore_rules() {
        let mut policy = RateLimitPolicy::new(RateLimits::new().with_limit(TimeWindow::Second, 1));
        policy.ip_rules.insert("0.0.0.0/0".into(), RateLimits::new().with_limit(TimeWindow::Second, 99));
        policy.client_rules.insert("k".into(), RateLimits::new().with_limit(TimeWindow::Second, 98));
        policy.endpoint_rules.insert("/".into(), RateLimits::new().with_limit(TimeWindow::Second, 97));

        let id = identity("1.2.3.4", "k", "/a");
        assert!(policy.matched_rules(&id).is_empty());
        assert_eq!(policy.find_limit(&id, TimeWindow::Second), 1);
    }

    #[test]
    fn test_route_rules_are_weaker_than_endpoint_rules() {
        let mut policy = all_scopes();
        policy.route_rules.insert("/orders".into(), RateLimits::new().with_limit(TimeWindow::Second, 2));
        policy.endpoint_rules.insert("/orders/export".into(), RateLimits::new().with_limit(TimeWindow::Second, 8));

        assert_eq!(policy.find_limit(&identity("1.1.1.1", "k", "/orders/export"), TimeWindow::Second), 8);
        assert_eq!(policy.find_limit(&identity("1.1.1.1", "k", "/orders/1"), TimeWindow::Second), 2);
    }

    #[test]
    fn test_unparseable_ip_rule_is_skipped() {
        let mut policy = all_scopes();
        policy.ip_rules.insert("not-a-cidr".into(), RateLimits::new().with_limit(TimeWindow::Second, 1));
        policy.ip_rules.insert("1.2.3.0/24".into(), RateLimits::new().with_limit(TimeWindow::Second, 6));

        assert_eq!(policy.find_limit(&identity("1.2.3.4", "k", "/"), TimeWindow::Second), 6);
    }

    #[test]
    fn test_ip_patterns_compile_once() {
        let mut policy = all_scopes();
        policy.ip_rules.insert("10.0.0.0/8".into(), RateLimits::new().with_limit(TimeWindow::Second, 3));
        assert!(!policy.ip_matchers.is_compiled());

        let id = identity("10.2.3.4", "k", "/");
        assert_eq!(policy.find_limit(&id, TimeWindow::Second), 3);
        assert!(policy.ip_matchers.is_compiled());

        let first: *const CompiledIpPatterns = policy.compiled_ip_patterns();
        policy.find_limit(&id, TimeWindow::Second);
        assert!(std::ptr::eq(first, policy.compiled_ip_patterns()));

        let copy = policy.clone();
        assert!(!copy.ip_matchers.is_compiled());
        assert_eq!(copy, policy);
    }

    #[test]
    fn test_recompile_picks_up_edited_patterns() {
        let mut policy = all_scopes();
        policy.compile();

        policy.ip_rules.insert("10.0.0.0/8".into(), RateLimits::new().with_limit(TimeWindow::Second, 3));
        policy.ip_whitelist.insert("192.168.0.0/16".into());
        policy.recompile();

        assert_eq!(policy.find_limit(&identity("10.2.3.4", "k", "/"), TimeWindow::Second), 3);
        assert!(policy.is_whitelisted(&identity("192.168.1.1", "k", "/")));
    }

    #[test]
    fn test_from_provider() {
        let yaml = r#"
settings:
  per_minute: 30
  ip_throttling: true
  client_throttling: true
  endpoint_throttling: true
rules:
  - entry: 10.0.0.0/8
    policy_type: ip_throttling
    per_second: 2
  - entry: premium
    policy_type: client_throttling
    per_minute: 600
  - entry: /upload
    policy_type: endpoint_throttling
    per_hour: 20
whitelists:
  - entry: 127.0.0.1
    policy_type: ip_throttling
  - entry: admin
    policy_type: client_throttling
  - entry: /status
    policy_type: endpoint_throttling
"#;
        let provider = RecordPolicyProvider::from_yaml(yaml).unwrap();
        let policy = RateLimitPolicy::from_provider(&provider).unwrap();

        assert_eq!(policy.rates.limit(TimeWindow::Minute), 30);
        assert!(policy.ip_throttling && policy.client_throttling && policy.endpoint_throttling);
        assert_eq!(policy.ip_rules["10.0.0.0/8"].limit(TimeWindow::Second), 2);
        assert_eq!(policy.client_rules["premium"].limit(TimeWindow::Minute), 600);
        assert_eq!(policy.endpoint_rules["/upload"].limit(TimeWindow::Hour), 20);
        assert!(policy.ip_whitelist.contains("127.0.0.1"));
        assert!(policy.client_whitelist.contains("admin"));
        assert!(policy.endpoint_whitelist.contains("/status"));
    }
}
