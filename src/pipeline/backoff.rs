use std::time::Duration;

use rand::Rng;

use crate::settings::RetrySettings;

/// Exponential backoff: `base * 2^(n-1)` after the n-th failure, capped at
/// `max_delay`, then spread by up to `jitter_ratio` in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter_ratio: f64,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.base_delay_ms)),
            max_attempts: settings.max_attempts.max(1),
            jitter_ratio: settings.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// True once `attempts` upload requests have been spent.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        self.jittered(raw.min(self.max_delay))
    }

    /// Honors a server `Retry-After` when it asks for more than the backoff.
    pub fn delay_with_hint(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.delay_for(failures);
        match retry_after {
            Some(hint) if hint > backoff => hint.min(self.max_delay),
            _ => backoff,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ratio: f64) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter_ratio,
        }
    }

    #[test]
    fn delay_doubles_per_failure_until_capped() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = policy(0.25);
        for _ in 0..200 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_secs(6), "{delay:?}");
            assert!(delay <= Duration::from_secs(10), "{delay:?}");
        }
    }

    #[test]
    fn attempts_budget_and_retry_after() {
        let policy = policy(0.0);
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.delay_with_hint(3, Some(Duration::from_secs(1))),
            Duration::from_secs(8)
        );
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(3_600))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn built_from_settings() {
        let policy = RetryPolicy::from(&RetrySettings {
            base_delay_ms: 500,
            max_delay_ms: 100,
            max_attempts: 0,
            jitter_ratio: 3.0,
        });
        assert_eq!(policy.max_delay, Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.jitter_ratio, 1.0);
    }
}
