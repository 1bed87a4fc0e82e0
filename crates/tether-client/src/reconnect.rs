//! Exponential backoff for automatic reconnection.

use rand::Rng;
use std::time::Duration;

/// Smallest delay ever scheduled between attempts.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(1);

/// Configuration for automatic reconnection after a connection failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically when the connection fails.
    pub enabled: bool,
    /// Maximum number of attempts per failure (0 = unlimited).
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl ReconnectPolicy {
    /// Enabled policy with the default tuning.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Whether `attempt` (1-based) is beyond the configured ceiling.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    ///
    /// `base_delay * 2^(attempt-1)` capped at `max_delay`, then jittered by
    /// `±jitter` and clamped to `[MIN_RECONNECT_DELAY, max_delay]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let capped = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 {
            capped.mul_f64(rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter)))
        } else {
            capped
        };

        jittered.clamp(MIN_RECONNECT_DELAY, self.max_delay.max(MIN_RECONNECT_DELAY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            max_attempts: 0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }

    #[test]
    fn default_policy_values() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.enabled);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!((policy.jitter - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = no_jitter();
        let delays: Vec<u64> = (1..=8)
            .map(|n| policy.delay_for_attempt(n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = ReconnectPolicy {
            jitter: 0.25,
            ..no_jitter()
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(3).as_millis();
            assert!((3000..=5000).contains(&delay), "delay={delay}");
        }
    }

    #[test]
    fn jitter_never_exceeds_max() {
        let policy = ReconnectPolicy {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..50 {
            assert!(policy.delay_for_attempt(10) <= policy.max_delay);
        }
    }

    #[test]
    fn zero_base_is_floored() {
        let policy = ReconnectPolicy {
            base_delay: Duration::ZERO,
            ..no_jitter()
        };
        assert_eq!(policy.delay_for_attempt(1), MIN_RECONNECT_DELAY);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        assert_eq!(
            no_jitter().delay_for_attempt(u32::MAX),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn exhaustion_ceiling() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..no_jitter()
        };
        assert!(!policy.exhausted(1));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(!no_jitter().exhausted(1_000));
    }
}
