//! Request identity used for whitelisting, rule lookup and key derivation.

use std::fmt;

/// Client key used when a request carries none.
pub const ANONYMOUS_CLIENT: &str = "anon";

/// The identity of an inbound request.
///
/// Built by the host integration from its native request type; immutable for
/// the duration of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    /// Resolved client address, possibly with a port suffix
    pub client_ip: String,
    /// Client key, `"anon"` when absent
    pub client_key: String,
    /// Lower-cased request path without query string
    pub endpoint: String,
    /// Skip throttling for this request regardless of policy
    pub force_whitelist: bool,
}

impl RequestIdentity {
    /// Create an identity, normalizing the client key and endpoint.
    pub fn new(client_ip: impl Into<String>, client_key: Option<&str>, endpoint: &str) -> Self {
        let client_key = client_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(ANONYMOUS_CLIENT);

        Self {
            client_ip: client_ip.into(),
            client_key: client_key.to_string(),
            endpoint: normalize_endpoint(endpoint),
            force_whitelist: false,
        }
    }

    /// Mark this request as exempt from all throttling.
    pub fn with_force_whitelist(mut self, force: bool) -> Self {
        self.force_whitelist = force;
        self
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "throttle_{}_{}_{}", self.client_ip, self.client_key, self.endpoint)
    }
}

/// Lower-case a request path and drop any query string or fragment.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let end = endpoint.find(['?', '#']).unwrap_or(endpoint.len());
    endpoint[..end].trim().to_lowercase()
}
