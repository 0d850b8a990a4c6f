//! Retry delay schedule for the sync queue.

use std::time::Duration;

/// Exponential backoff with a cap and proportional jitter.
///
/// For the n-th consecutive failure the delay is
/// `min(cap, base * 2^(n-1))` plus up to `jitter` times that amount, and is
/// never shorter than the delay used after the previous failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Fraction in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(120),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failure number `attempt` (1-based).
    ///
    /// `sample` is a uniform draw in `[0, 1)`; `previous` is the delay
    /// applied after the prior failure of the same item.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, previous: Duration, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);

        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        let delay = exp.saturating_add(exp.mul_f64(jitter));

        delay.max(previous).min(self.upper_bound())
    }

    /// Longest delay the policy can produce.
    #[must_use]
    pub fn upper_bound(&self) -> Duration {
        self.cap
            .saturating_add(self.cap.mul_f64(self.jitter.clamp(0.0, 1.0)))
    }

    /// Whether `attempts` failures exhaust the policy.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_without_jitter() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        let delays: Vec<u64> = (1..=8)
            .map(|n| policy.delay_for(n, Duration::ZERO, 0.5).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 120, 120]);
    }

    #[test]
    fn test_delays_are_bounded_and_non_decreasing() {
        let policy = BackoffPolicy::default();
        let samples = [0.99, 0.0, 0.7, 0.1, 0.95, 0.0, 0.5, 0.0, 0.3];

        let mut previous = Duration::ZERO;
        for (i, sample) in samples.iter().enumerate() {
            let delay = policy.delay_for(i as u32 + 1, previous, *sample);
            assert!(delay >= previous, "delay shrank at attempt {}", i + 1);
            assert!(delay <= policy.upper_bound());
            previous = delay;
        }
        assert_eq!(policy.upper_bound(), Duration::from_secs(144));
    }

    #[test]
    fn test_exhaustion() {
        let policy = BackoffPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }
}
