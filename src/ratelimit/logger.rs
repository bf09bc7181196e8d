//! Reporting of blocked requests.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Debug;
use tracing::warn;

use super::counter::TimeWindow;

/// Details of one blocked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleLogEntry {
    /// The throttle key whose counter tripped
    pub request_id: String,
    pub client_ip: String,
    pub client_key: String,
    pub endpoint: String,
    /// Requests counted in the window, including this one
    pub total_requests: u64,
    /// Start of the tripped window
    pub start_period: DateTime<Utc>,
    /// Effective limit for the window
    pub rate_limit: u64,
    pub rate_limit_period: TimeWindow,
    pub log_date: DateTime<Utc>,
}

/// Receives an entry for every blocked request.
pub trait ThrottleLogger: Send + Sync + Debug {
    fn log(&self, entry: &ThrottleLogEntry);
}

/// Logger that emits a structured `tracing` warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingThrottleLogger;

impl ThrottleLogger for TracingThrottleLogger {
    fn log(&self, entry: &ThrottleLogEntry) {
        warn!(
            request_id = %entry.request_id,
            client_ip = %entry.client_ip,
            client_key = %entry.client_key,
            endpoint = %entry.endpoint,
            total_requests = entry.total_requests,
            rate_limit = entry.rate_limit,
            period = %entry.rate_limit_period,
            start_period = %entry.start_period,
            "Request blocked: {} calls in one {} exceed limit of {}",
            entry.total_requests,
            entry.rate_limit_period,
            entry.rate_limit
        );
    }
}
