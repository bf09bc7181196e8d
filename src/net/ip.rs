//! Client address parsing and IP rule matching.
//!
//! Rules are written as a bare address (`10.0.0.1`), a CIDR block
//! (`10.0.0.0/8`, `fd00::/8`), a dotted netmask (`192.168.0.0/255.255.255.0`)
//! or an inclusive range (`10.0.0.10 - 10.0.0.20`). Patterns that cannot be
//! parsed never match anything.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net};
use tracing::debug;

use crate::error::TurnstileError;

/// Address substituted for client IPs that cannot be parsed.
///
/// Forwarded-for headers regularly carry junk; evaluation continues with this
/// link-local address instead of failing.
pub const SENTINEL_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(169, 254, 0, 0));

/// Parse a client address, tolerating an optional port suffix.
///
/// Accepts `1.2.3.4`, `1.2.3.4:8080`, `::1`, `[::1]` and `[::1]:8080`.
/// IPv4-mapped IPv6 addresses are folded to their IPv4 form. Anything else
/// yields [`SENTINEL_ADDRESS`].
pub fn parse_ip(value: &str) -> IpAddr {
    parse_ip_strict(value).unwrap_or(SENTINEL_ADDRESS)
}

fn parse_ip_strict(value: &str) -> Option<IpAddr> {
    let value = value.trim();

    let ip = if let Ok(ip) = value.parse::<IpAddr>() {
        ip
    } else if let Ok(addr) = value.parse::<SocketAddr>() {
        addr.ip()
    } else {
        value
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|inner| inner.parse::<IpAddr>().ok())?
    };

    Some(ip.to_canonical())
}

/// Whether an address belongs to a private or link-local range.
///
/// Covers 10/8, 172.16/12, 192.168/16, 169.254/16 and IPv6 unique-local
/// `fd00::/8`. Unparseable input maps to the link-local sentinel and is
/// therefore reported as private.
pub fn is_private_address(value: &str) -> bool {
    match parse_ip(value) {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            a == 10
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || (a == 169 && b == 254)
        }
        IpAddr::V6(v6) => v6.octets()[0] == 0xfd,
    }
}

/// A parsed IP rule pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    /// A network block; a bare address is a /32 or /128 block
    Net(IpNet),
    /// An inclusive address range of a single family
    Range { start: IpAddr, end: IpAddr },
}

impl IpRule {
    /// Check whether `ip` falls inside this rule.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            IpRule::Net(net) => net.contains(ip),
            IpRule::Range { start, end } => match (start, end, ip) {
                (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(ip)) => s <= ip && ip <= e,
                (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(ip)) => s <= ip && ip <= e,
                _ => false,
            },
        }
    }

    /// Number of addresses covered, saturating at `u128::MAX`.
    ///
    /// Used to prefer the narrowest of several matching rules.
    pub fn size(&self) -> u128 {
        match self {
            IpRule::Net(net) => {
                let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
                1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
            }
            IpRule::Range { start, end } => {
                let span = addr_to_u128(end) - addr_to_u128(start);
                span.saturating_add(1)
            }
        }
    }
}

fn addr_to_u128(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

impl FromStr for IpRule {
    type Err = TurnstileError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        let invalid = || TurnstileError::Policy(format!("invalid IP rule '{}'", pattern));
        let pattern = pattern.trim();

        if let Some((start, end)) = pattern.split_once('-') {
            let start = parse_ip_strict(start).ok_or_else(invalid)?;
            let end = parse_ip_strict(end).ok_or_else(invalid)?;
            if start.is_ipv4() != end.is_ipv4() {
                return Err(invalid());
            }
            let (start, end) = if start <= end { (start, end) } else { (end, start) };
            return Ok(IpRule::Range { start, end });
        }

        if let Some((addr, suffix)) = pattern.split_once('/') {
            if let Ok(net) = pattern.parse::<IpNet>() {
                return Ok(IpRule::Net(net));
            }
            // Dotted netmask, e.g. 192.168.0.0/255.255.255.0
            let addr = addr.trim().parse::<Ipv4Addr>().map_err(|_| invalid())?;
            let mask = u32::from(suffix.trim().parse::<Ipv4Addr>().map_err(|_| invalid())?);
            if mask.count_ones() != mask.leading_ones() {
                return Err(invalid());
            }
            let prefix = u8::try_from(mask.count_ones()).map_err(|_| invalid())?;
            let net = Ipv4Net::new(addr, prefix).map_err(|_| invalid())?;
            return Ok(IpRule::Net(IpNet::V4(net)));
        }

        let ip = parse_ip_strict(pattern).ok_or_else(invalid)?;
        Ok(IpRule::Net(IpNet::from(ip)))
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRule::Net(net) => write!(f, "{}", net),
            IpRule::Range { start, end } => write!(f, "{} - {}", start, end),
        }
    }
}

/// A compiled set of IP rule patterns.
///
/// Each rule keeps the pattern text it was built from so callers can look the
/// matching entry back up in their own rule maps.
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    rules: Vec<(String, IpRule)>,
}

impl IpMatcher {
    /// Compile a set of patterns, skipping the ones that do not parse.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .filter_map(|pattern| {
                let pattern = pattern.as_ref();
                match pattern.parse::<IpRule>() {
                    Ok(rule) => Some((pattern.to_string(), rule)),
                    Err(e) => {
                        debug!(pattern = %pattern, error = %e, "Skipping unparseable IP rule");
                        None
                    }
                }
            })
            .collect();

        Self { rules }
    }

    /// Check whether any rule contains `ip`.
    pub fn contains(&self, ip: &str) -> bool {
        let ip = parse_ip(ip);
        self.rules.iter().any(|(_, rule)| rule.contains(&ip))
    }

    /// Return the narrowest rule pattern that contains `ip`.
    pub fn matching_rule(&self, ip: &str) -> Option<&str> {
        self.matching_rules(ip).into_iter().next()
    }

    /// Return every rule pattern that contains `ip`, narrowest first.
    ///
    /// Rules covering the same number of addresses are ordered by pattern
    /// text so the result does not depend on map iteration order.
    pub fn matching_rules(&self, ip: &str) -> Vec<&str> {
        let ip = parse_ip(ip);
        let mut matches: Vec<(&str, u128)> = self
            .rules
            .iter()
            .filter(|(_, rule)| rule.contains(&ip))
            .map(|(pattern, rule)| (pattern.as_str(), rule.size()))
            .collect();

        matches.sort_by(|a, b| match a.1.cmp(&b.1) {
            Ordering::Equal => a.0.cmp(b.0),
            other => other,
        });
        matches.into_iter().map(|(pattern, _)| pattern).collect()
    }

    /// Number of usable rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no usable rule was compiled.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Check whether any of `patterns` contains `ip`.
pub fn contains_ip<I, S>(patterns: I, ip: &str) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    IpMatcher::new(patterns).contains(ip)
}
