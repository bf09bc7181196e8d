//! Client address resolution behind proxies.

use super::ip::is_private_address;

/// Resolve the client address from an `X-Forwarded-For` value.
///
/// Returns the right-most hop that is not a private address, or `peer` when
/// the header is absent, empty or only lists private hops.
pub fn resolve_client_ip(forwarded_for: Option<&str>, peer: &str) -> String {
    let Some(header) = forwarded_for.filter(|h| !h.trim().is_empty()) else {
        return peer.to_string();
    };

    header
        .split(',')
        .map(str::trim)
        .filter(|hop| !hop.is_empty() && !is_private_address(hop))
        .last()
        .map_or_else(|| peer.to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_header_uses_peer() {
        assert_eq!(resolve_client_ip(None, "10.0.0.1"), "10.0.0.1");
        assert_eq!(resolve_client_ip(Some("   "), "10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_picks_rightmost_public_hop() {
        let header = "203.0.113.7, 198.51.100.2, 10.0.0.3";
        assert_eq!(resolve_client_ip(Some(header), "10.0.0.1"), "198.51.100.2");
    }

    #[test]
    fn test_only_private_hops_falls_back_to_peer() {
        let header = "10.0.0.3, 192.168.1.4";
        assert_eq!(resolve_client_ip(Some(header), "172.16.0.9"), "172.16.0.9");
    }

    #[test]
    fn test_malformed_hops_are_ignored() {
        let header = "203.0.113.7, unknown";
        assert_eq!(resolve_client_ip(Some(header), "10.0.0.1"), "203.0.113.7");
    }
}
