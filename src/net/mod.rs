//! Address parsing, IP rule matching and proxy-aware client resolution.

mod forwarded;
mod ip;

pub use forwarded::resolve_client_ip;
pub use ip::{contains_ip, is_private_address, parse_ip, IpMatcher, IpRule, SENTINEL_ADDRESS};
