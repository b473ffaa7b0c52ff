//! Per-identity window bookkeeping.

use chrono::{DateTime, Duration, Utc};

/// The counter state for one identity in its current fixed window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRecord {
    /// Attempts counted since `window_start`
    pub count: u64,
    /// When the current window began
    pub window_start: DateTime<Utc>,
}

impl WindowRecord {
    /// Open a new window at `now` holding a single attempt.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    /// Time elapsed since the window opened.
    ///
    /// Negative when `now` is behind `window_start` (clock skew between
    /// callers); such a window is never considered expired.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now - self.window_start
    }

    /// Whether the window has run out: `now - window_start > window_length`.
    pub fn is_expired(&self, now: DateTime<Utc>, window_length: Duration) -> bool {
        self.elapsed(now) > window_length
    }

    /// Time left until the window resets, floored at zero.
    pub fn duration_until_reset(&self, now: DateTime<Utc>, window_length: Duration) -> std::time::Duration {
        (window_length - self.elapsed(now))
            .to_std()
            .unwrap_or_default()
    }
}
