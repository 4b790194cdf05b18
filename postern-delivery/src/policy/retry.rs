//! Retry policy for failed delivery attempts.
//!
//! Backoff is linear: after the n-th consecutive failure the next attempt is
//! due `n * retry_delay_secs` later. A record that keeps failing after
//! `max_retries` retries is given up on.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Retries allowed before a record is marked failed
pub const MAX_RETRIES: u32 = 250;

/// Backoff step, in seconds
pub const RETRY_DELAY_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Once a failed attempt finds more retries than this already made, the
    /// record fails for good.
    ///
    /// Default: 250
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Delay added per retry already made.
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            retry_delay_secs: defaults::retry_delay_secs(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a failure with `retry_count` retries behind it is final.
    #[must_use]
    pub const fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }

    /// When to try again after a failure at `now`, where `retry_count`
    /// already includes that failure.
    #[must_use]
    pub fn next_retry(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = self.retry_delay_secs.saturating_mul(u64::from(retry_count));
        i64::try_from(delay)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        super::MAX_RETRIES
    }

    pub const fn retry_delay_secs() -> u64 {
        super::RETRY_DELAY_SECS
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 250);
        assert_eq!(policy.retry_delay_secs, 5);
    }

    #[test]
    fn test_is_exhausted() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(249));
        assert!(!policy.is_exhausted(250));
        assert!(policy.is_exhausted(251));
    }

    #[test]
    fn test_backoff_is_linear() {
        let policy = RetryPolicy::default();
        let now = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();

        assert_eq!(policy.next_retry(now, 1), now + Duration::seconds(5));
        assert_eq!(policy.next_retry(now, 2), now + Duration::seconds(10));
        assert_eq!(policy.next_retry(now, 251), now + Duration::seconds(1255));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let policy: RetryPolicy = ron::from_str("(retry_delay_secs: 60)").unwrap_or_default();
        assert_eq!(policy.max_retries, 250);
        assert_eq!(policy.retry_delay_secs, 60);
    }
}
