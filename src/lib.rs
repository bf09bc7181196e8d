//! Turnstile - Multi-scope Request Throttling
//!
//! This crate decides whether an incoming request may proceed based on
//! per-second through per-week quotas keyed on client IP, client key and
//! endpoint. Policies support per-IP (CIDR and range), per-client and
//! per-endpoint overrides plus whitelists, and counters live in a pluggable
//! store: in process by default, or Redis with the `redis-store` feature.

pub mod config;
pub mod error;
pub mod net;
pub mod ratelimit;
