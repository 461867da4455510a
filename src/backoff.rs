//! Exponential backoff with jitter for operation polling.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parameters governing the operation poller.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First interval before jitter.
    pub initial_interval: Duration,
    /// Jitter applied to every interval, as a fraction in `[0, 1]`.
    pub randomization_factor: f64,
    /// Growth factor applied after every sleep; at least `1.0`.
    pub multiplier: f64,
    /// Upper bound for any single interval.
    pub max_interval: Duration,
    /// Budget for the cumulative time spent sleeping.
    pub max_elapsed_time: Duration,
}

/// Errors raised when a [`BackoffPolicy`] is inconsistent.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackoffPolicyError {
    /// Raised when an interval is zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    /// Raised when the randomization factor is outside `[0, 1]`.
    #[error("randomization factor must be within [0, 1], got {0}")]
    RandomizationFactor(String),
    /// Raised when the multiplier is below one or not finite.
    #[error("multiplier must be a finite number >= 1, got {0}")]
    Multiplier(String),
    /// Raised when the max interval is below the initial interval.
    #[error("max interval must not be smaller than the initial interval")]
    MaxBelowInitial,
}

impl BackoffPolicy {
    /// Checks the policy for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`BackoffPolicyError`] describing the first violated bound.
    pub fn validate(&self) -> Result<(), BackoffPolicyError> {
        if self.initial_interval.is_zero() {
            return Err(BackoffPolicyError::ZeroInterval("initial interval"));
        }
        if self.max_interval.is_zero() {
            return Err(BackoffPolicyError::ZeroInterval("max interval"));
        }
        if self.max_elapsed_time.is_zero() {
            return Err(BackoffPolicyError::ZeroInterval("max elapsed time"));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(BackoffPolicyError::RandomizationFactor(
                self.randomization_factor.to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(BackoffPolicyError::Multiplier(self.multiplier.to_string()));
        }
        if self.max_interval < self.initial_interval {
            return Err(BackoffPolicyError::MaxBelowInitial);
        }
        Ok(())
    }

    /// Starts a fresh interval sequence for this policy.
    #[must_use]
    pub const fn start(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: *self,
            current: self.initial_interval,
        }
    }
}

/// Stateful interval generator derived from a [`BackoffPolicy`].
///
/// The first interval is the jittered initial interval; each following one
/// grows by the multiplier. Every returned value lies within
/// `current * (1 ± randomization_factor)` and never exceeds the max interval.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl ExponentialBackoff {
    /// Returns the un-jittered interval the next call will be centred on.
    #[must_use]
    pub const fn current_interval(&self) -> Duration {
        self.current
    }

    /// Produces the next sleep interval and advances the sequence.
    pub fn next_interval<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let centre = self.current;
        self.current = self.grow(centre);
        self.jitter(centre, rng).min(self.policy.max_interval)
    }

    #[expect(
        clippy::float_arithmetic,
        reason = "the multiplier is a user supplied real factor"
    )]
    fn grow(&self, interval: Duration) -> Duration {
        let scaled = interval.as_secs_f64() * self.policy.multiplier;
        let max = self.policy.max_interval.as_secs_f64();
        if scaled >= max {
            self.policy.max_interval
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    #[expect(
        clippy::float_arithmetic,
        reason = "jitter is a symmetric fraction of the interval"
    )]
    fn jitter<R: Rng + ?Sized>(&self, interval: Duration, rng: &mut R) -> Duration {
        let factor = self.policy.randomization_factor;
        if factor <= 0.0 {
            return interval;
        }
        let centre = interval.as_secs_f64();
        let delta = centre * factor;
        let low = centre - delta;
        let high = centre + delta;
        Duration::from_secs_f64(rng.random_range(low..=high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn policy(randomization_factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_secs(1),
            randomization_factor,
            multiplier: 2.0,
            max_interval: Duration::from_secs(8),
            max_elapsed_time: Duration::from_secs(60),
        }
    }

    #[test]
    fn intervals_double_until_capped_without_jitter() {
        let mut backoff = policy(0.0).start();
        let mut rng = StdRng::seed_from_u64(7);
        let seen: Vec<u64> = (0..6)
            .map(|_| backoff.next_interval(&mut rng).as_secs())
            .collect();
        assert_eq!(seen, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn jittered_intervals_stay_within_bounds() {
        let mut backoff = policy(0.5).start();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let centre = backoff.current_interval();
            let next = backoff.next_interval(&mut rng);
            assert!(next >= centre.mul_f64(0.5), "{next:?} below {centre:?}");
            assert!(next <= centre.mul_f64(1.5), "{next:?} above {centre:?}");
            assert!(next <= Duration::from_secs(8));
        }
    }

    #[rstest]
    #[case::negative_jitter(BackoffPolicy { randomization_factor: -0.1, ..policy(0.0) })]
    #[case::jitter_above_one(BackoffPolicy { randomization_factor: 1.5, ..policy(0.0) })]
    #[case::shrinking(BackoffPolicy { multiplier: 0.5, ..policy(0.0) })]
    #[case::zero_initial(BackoffPolicy { initial_interval: Duration::ZERO, ..policy(0.0) })]
    #[case::max_below_initial(BackoffPolicy { max_interval: Duration::from_millis(10), ..policy(0.0) })]
    fn validate_rejects_inconsistent_policies(#[case] candidate: BackoffPolicy) {
        assert!(candidate.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert_eq!(policy(0.5).validate(), Ok(()));
    }
}
