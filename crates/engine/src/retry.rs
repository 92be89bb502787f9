//! Bounded retry policy for failed deliveries.

use chrono::{DateTime, Duration, Utc};

use drip_core::config::{seconds, RetryConfig};
use drip_core::DripResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the row scheduled at this time.
    RetryAt(DateTime<Utc>),
    /// Stop retrying; the row is paused for an operator.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> DripResult<Self> {
        config.validate()?;
        Ok(Self {
            max_attempts: config.max_attempts,
            backoff: seconds("retry.backoff_secs", config.backoff_secs)?,
            max_backoff: seconds("retry.max_backoff_secs", config.max_backoff_secs)?,
        })
    }

    /// Decide what happens after the `attempts`-th consecutive failure of a
    /// row that was scheduled at `scheduled`.
    ///
    /// Without a backoff the schedule is left as it was, so the row stays
    /// due and is retried on the next invocation.
    pub fn after_failure(
        &self,
        attempts: u32,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return RetryDecision::GiveUp;
        }
        if self.backoff.is_zero() {
            return RetryDecision::RetryAt(scheduled);
        }
        let delay = 2i32
            .checked_pow(attempts.saturating_sub(1))
            .and_then(|factor| self.backoff.checked_mul(factor))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff));
        RetryDecision::RetryAt(now + delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_retries_in_place() {
        let policy = RetryPolicy::from_config(&RetryConfig::default()).unwrap();
        let now = Utc::now();
        let scheduled = now - Duration::hours(1);
        assert_eq!(
            policy.after_failure(1, scheduled, now),
            RetryDecision::RetryAt(scheduled)
        );
        assert_eq!(
            policy.after_failure(9, scheduled, now),
            RetryDecision::RetryAt(scheduled)
        );
        assert_eq!(policy.after_failure(10, scheduled, now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_unbounded_policy_never_gives_up() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: None,
            ..RetryConfig::default()
        })
        .unwrap();
        let now = Utc::now();
        assert_eq!(
            policy.after_failure(10_000, now, now),
            RetryDecision::RetryAt(now)
        );
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: None,
            backoff_secs: 60,
            max_backoff_secs: 600,
        })
        .unwrap();
        let now = Utc::now();
        assert_eq!(
            policy.after_failure(1, now, now),
            RetryDecision::RetryAt(now + Duration::seconds(60))
        );
        assert_eq!(
            policy.after_failure(3, now, now),
            RetryDecision::RetryAt(now + Duration::seconds(240))
        );
        assert_eq!(
            policy.after_failure(8, now, now),
            RetryDecision::RetryAt(now + Duration::seconds(600))
        );
    }

    #[test]
    fn test_long_failure_streak_stays_at_cap() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: None,
            backoff_secs: 86_400,
            max_backoff_secs: 30 * 86_400,
        })
        .unwrap();
        let now = Utc::now();
        for attempts in [20, 31, 32, 64, u32::MAX] {
            assert_eq!(
                policy.after_failure(attempts, now, now),
                RetryDecision::RetryAt(now + Duration::days(30))
            );
        }
    }

    #[test]
    fn test_out_of_range_config_is_rejected() {
        assert!(RetryPolicy::from_config(&RetryConfig {
            max_attempts: None,
            backoff_secs: u64::MAX,
            max_backoff_secs: u64::MAX,
        })
        .is_err());
    }
}
