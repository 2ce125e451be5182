//! Retry policy: attempt budget plus exponential backoff with symmetric jitter.

use crate::error::ProxyError;
use rand::Rng;
use std::time::Duration;

/// Delay computation for retries.
///
/// The delay for attempt `n ≥ 1` is `min(initial · multiplier^(n−1), max)`,
/// then symmetric jitter spreads it uniformly over
/// `[base·(1−jitter), base·(1+jitter)]`. Attempt 0 and a disabled policy
/// yield zero.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    enabled: bool,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(enabled: bool, initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            enabled,
            initial,
            max,
            // Invariants: multiplier ≥ 1, jitter ∈ [0, 1].
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO, Duration::ZERO, 1.0, 0.0)
    }

    /// Jittered delay before the given attempt (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Deterministic variant for tests.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        if !self.enabled || attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay(attempt);
        if base == Duration::ZERO || self.jitter == 0.0 {
            return base;
        }
        let factor = rng.random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Un-jittered delay: `min(initial · multiplier^(attempt−1), max)`.
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

/// Attempt budget plus backoff, the retry contract consumed by the fallback
/// engine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self { max_retries, backoff }
    }

    /// False once the budget is spent or the error is client-terminal.
    pub fn should_retry(&self, attempt: u32, err: &ProxyError) -> bool {
        attempt < self.max_retries && err.retryable
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy::new(
            true,
            Duration::from_millis(100),
            Duration::from_millis(5000),
            2.0,
            jitter,
        )
    }

    #[test]
    fn attempt_zero_is_free() {
        assert_eq!(policy(0.5).delay(0), Duration::ZERO);
    }

    #[test]
    fn disabled_policy_never_delays() {
        let p = BackoffPolicy::new(
            false,
            Duration::from_millis(100),
            Duration::from_secs(5),
            2.0,
            0.1,
        );
        for attempt in 0..5 {
            assert_eq!(p.delay(attempt), Duration::ZERO);
        }
    }

    #[test]
    fn exponential_growth_without_jitter() {
        let p = policy(0.0);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn growth_is_capped_at_max() {
        let p = policy(0.0);
        assert_eq!(p.delay(10), Duration::from_millis(5000));
        assert_eq!(p.delay(60), Duration::from_millis(5000));
    }

    #[test]
    fn jitter_stays_within_symmetric_band() {
        let p = policy(0.25);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..6 {
            let base = policy(0.0).delay(attempt);
            let lo = base.mul_f64(0.75);
            let hi = base.mul_f64(1.25);
            for _ in 0..50 {
                let d = p.delay_with_rng(attempt, &mut rng);
                assert!(d >= lo && d <= hi, "attempt {attempt}: {d:?} outside [{lo:?}, {hi:?}]");
            }
        }
    }

    #[test]
    fn delay_bounded_above_by_max_plus_jitter() {
        let p = policy(1.0);
        let mut rng = StdRng::seed_from_u64(42);
        let bound = Duration::from_millis(5000).mul_f64(2.0);
        for _ in 0..200 {
            assert!(p.delay_with_rng(50, &mut rng) <= bound);
        }
    }

    #[test]
    fn multiplier_below_one_is_lifted() {
        let p = BackoffPolicy::new(
            true,
            Duration::from_millis(100),
            Duration::from_secs(5),
            0.5,
            0.0,
        );
        // Effective multiplier is 1: constant delay.
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(4), Duration::from_millis(100));
    }

    #[test]
    fn should_retry_honors_budget_and_classification() {
        let retry = RetryPolicy::new(3, BackoffPolicy::disabled());
        let retryable = ProxyError::from_status(503, "upstream down");
        let terminal = ProxyError::from_status(401, "bad key");

        assert!(retry.should_retry(1, &retryable));
        assert!(retry.should_retry(2, &retryable));
        assert!(!retry.should_retry(3, &retryable));
        assert!(!retry.should_retry(1, &terminal));
    }
}
