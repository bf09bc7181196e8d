//! Outcome of a rate limit evaluation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::counter::TimeWindow;

/// Details of a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Throttled {
    /// The effective limit that was exceeded
    pub limit: u64,
    /// The window whose limit was exceeded
    pub window: TimeWindow,
    /// Seconds until the caller should retry, at least one
    pub retry_after_secs: u64,
    /// Requests counted in the window, including the rejected one
    pub total_requests: u64,
    /// Start of the exceeded window
    pub window_start: DateTime<Utc>,
}

impl fmt::Display for Throttled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "API calls quota exceeded! maximum admitted {} per {}.",
            self.limit, self.window
        )
    }
}

/// Whether a request may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Blocked(Throttled),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    pub fn is_blocked(&self) -> bool {
        !self.is_allowed()
    }

    /// The rejection details, if blocked.
    pub fn throttled(&self) -> Option<&Throttled> {
        match self {
            Decision::Allowed => None,
            Decision::Blocked(throttled) => Some(throttled),
        }
    }

    /// Value for a `Retry-After` header, if blocked.
    pub fn retry_after(&self) -> Option<u64> {
        self.throttled().map(|t| t.retry_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked() -> Decision {
        Decision::Blocked(Throttled {
            limit: 2,
            window: TimeWindow::Minute,
            retry_after_secs: 42,
            total_requests: 3,
            window_start: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        })
    }

    #[test]
    fn test_decision_accessors() {
        assert!(Decision::Allowed.is_allowed());
        assert_eq!(Decision::Allowed.retry_after(), None);

        let decision = blocked();
        assert!(decision.is_blocked());
        assert_eq!(decision.retry_after(), Some(42));
        assert_eq!(decision.throttled().map(|t| t.window), Some(TimeWindow::Minute));
    }

    #[test]
    fn test_quota_message() {
        let message = blocked().throttled().unwrap().to_string();
        assert_eq!(message, "API calls quota exceeded! maximum admitted 2 per Minute.");
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_value(Decision::Allowed).unwrap();
        assert_eq!(json["decision"], "allowed");

        let json = serde_json::to_value(blocked()).unwrap();
        assert_eq!(json["decision"], "blocked");
        assert_eq!(json["window"], "minute");
        assert_eq!(json["retry_after_secs"], 42);
    }
}
