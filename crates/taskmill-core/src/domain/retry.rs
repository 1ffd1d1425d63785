//! Retry policy: decides backoff delays after a failed run.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Randomization applied on top of the computed delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Exact delay.
    #[default]
    None,
    /// `delay/2 + random[0, delay/2]`. Spreads retries of tasks that failed together.
    Equal,
}

/// Exponential backoff for failed tasks.
///
/// Can be set per task type; otherwise the manager-wide default from config applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Growth factor per additional failure.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    #[serde(default)]
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
            jitter: Jitter::None,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: Jitter::None,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt, given how many attempts have failed so far
    /// (1-indexed; 0 is treated as 1).
    ///
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`. The result is
    /// never zero, so a retry always lands strictly after the failed run.
    ///
    /// With base=30s, multiplier=2.0, max=1h:
    /// - attempt 1: 30s
    /// - attempt 2: 60s
    /// - attempt 3: 120s
    /// - attempt 8: 1h (capped)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let delay = if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        };

        let delay = match self.jitter {
            Jitter::None => delay,
            Jitter::Equal => equal_jitter(delay),
        };
        delay.max(Duration::from_millis(1))
    }
}

fn equal_jitter(delay: Duration) -> Duration {
    let half = (delay.as_millis() / 2) as u64;
    if half == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(30));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.jitter, Jitter::None);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(10, 60)]
    fn exponential_backoff_is_capped(#[case] attempts: u32, #[case] expected_secs: u64) {
        let policy = RetryPolicy::exponential(
            Duration::from_secs(2),
            2.0,
            Duration::from_secs(60),
        );
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(expected_secs));
    }

    #[test]
    fn equal_jitter_stays_within_half_and_full_delay() {
        let policy = RetryPolicy::exponential(
            Duration::from_secs(10),
            1.0,
            Duration::from_secs(60),
        )
        .with_jitter(Jitter::Equal);

        for _ in 0..100 {
            let d = policy.next_delay(1);
            assert!(d >= Duration::from_secs(5));
            assert!(d <= Duration::from_secs(10));
        }
    }

    #[test]
    fn zero_base_delay_still_moves_forward() {
        let policy = RetryPolicy::exponential(Duration::ZERO, 2.0, Duration::from_secs(1));
        assert!(policy.next_delay(1) > Duration::ZERO);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(u32::MAX), policy.max_delay);
    }
}
