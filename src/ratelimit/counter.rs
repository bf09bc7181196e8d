//! Time windows and throttle counters.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TurnstileError;

/// Time window for rate limiting.
///
/// Variants are declared narrowest first, so the derived ordering is the
/// canonical evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
    /// Per-week rate limiting
    Week,
}

impl TimeWindow {
    /// All windows, narrowest to widest.
    pub const ALL: [TimeWindow; 5] = [
        TimeWindow::Second,
        TimeWindow::Minute,
        TimeWindow::Hour,
        TimeWindow::Day,
        TimeWindow::Week,
    ];

    /// Length of this window in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 86_400,
            TimeWindow::Week => 604_800,
        }
    }

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// The window length as a calendar delta.
    pub fn span(&self) -> TimeDelta {
        // Largest window is one week, well inside TimeDelta's range.
        TimeDelta::seconds(self.seconds() as i64)
    }

    /// Name used in throttle keys and log output.
    pub fn name(&self) -> &'static str {
        match self {
            TimeWindow::Second => "Second",
            TimeWindow::Minute => "Minute",
            TimeWindow::Hour => "Hour",
            TimeWindow::Day => "Day",
            TimeWindow::Week => "Week",
        }
    }

    /// Seconds a blocked caller should wait before retrying.
    ///
    /// The window length minus the whole seconds elapsed since `window_start`,
    /// clamped to `1..=self.seconds()`.
    pub fn retry_after(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
        let elapsed = (now - window_start).num_seconds().max(0) as u64;
        self.seconds().saturating_sub(elapsed).clamp(1, self.seconds())
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TimeWindow {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" | "sec" | "s" => Ok(TimeWindow::Second),
            "minute" | "min" | "m" => Ok(TimeWindow::Minute),
            "hour" | "h" => Ok(TimeWindow::Hour),
            "day" | "d" => Ok(TimeWindow::Day),
            "week" | "w" => Ok(TimeWindow::Week),
            other => Err(TurnstileError::Policy(format!("unknown time window '{}'", other))),
        }
    }
}

/// The number of requests seen in one window for one throttle key.
///
/// A counter is anchored to the first request of its window and never slides:
/// increments keep the original `window_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleCounter {
    /// When the first request of this window arrived
    pub window_start: DateTime<Utc>,
    /// Requests counted so far, including the current one
    pub total_requests: u64,
}

impl ThrottleCounter {
    /// Start a new window at `now` with a single request.
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            total_requests: 1,
        }
    }

    /// A copy of this counter with one more request.
    pub fn incremented(&self) -> Self {
        Self {
            window_start: self.window_start,
            total_requests: self.total_requests.saturating_add(1),
        }
    }

    /// When this counter's window closes.
    pub fn expires_at(&self, window: TimeDelta) -> DateTime<Utc> {
        self.window_start + window
    }

    /// Whether the window ended before `now`.
    pub fn is_expired(&self, window: TimeDelta, now: DateTime<Utc>) -> bool {
        self.expires_at(window) < now
    }
}
