//! Exponential backoff between capture restarts after errors

use std::time::{Duration, SystemTime};

/// Backoff policy for re-arming capture after a failure
///
/// Retries are unbounded; only the delay grows. The failure count resets
/// after the next successful transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure (doubles each consecutive failure)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next capture after `failures` consecutive failures
    ///
    /// Zero failures means no backoff at all.
    #[must_use]
    pub fn delay_after(&self, failures: u32) -> Duration {
        match failures {
            0 => Duration::ZERO,
            n => delay_for_attempt(self, n - 1),
        }
    }
}

/// Compute the delay before the next attempt.
///
/// Follows `min(base_delay * 2^attempt + jitter, max_delay)`. Jitter is 0-25%
/// of the computed delay, derived from `SystemTime`.
#[must_use]
pub fn delay_for_attempt(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    // Derive a simple jitter from subsecond nanos of the system clock
    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    // Scale to 0-25% of the base delay
    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- delay_for_attempt ----------------------------------------------------

    #[test]
    fn exponential_growth() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };

        let d0 = delay_for_attempt(&policy, 0);
        let d1 = delay_for_attempt(&policy, 1);
        let d2 = delay_for_attempt(&policy, 2);

        assert!(d0 >= Duration::from_millis(100), "attempt 0: {d0:?}");
        assert!(d1 >= Duration::from_millis(200), "attempt 1: {d1:?}");
        assert!(d2 >= Duration::from_millis(400), "attempt 2: {d2:?}");
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = BackoffPolicy::default();

        // 1s * 2^6 = 64s, capped at 10s
        let d = delay_for_attempt(&policy, 6);
        assert_eq!(d, policy.max_delay);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(delay_for_attempt(&policy, u32::MAX), policy.max_delay);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        };

        for _ in 0..50 {
            let d = delay_for_attempt(&policy, 0);
            assert!(d >= Duration::from_millis(1000), "below base: {d:?}");
            assert!(d <= Duration::from_millis(1250), "above 125%: {d:?}");
        }
    }

    // -- delay_after ----------------------------------------------------------

    #[test]
    fn no_failures_means_no_delay() {
        assert_eq!(BackoffPolicy::default().delay_after(0), Duration::ZERO);
    }

    #[test]
    fn first_failure_waits_about_base_delay() {
        let policy = BackoffPolicy::default();
        let d = policy.delay_after(1);
        assert!(d >= Duration::from_secs(1));
        assert!(d <= Duration::from_millis(1250));
    }

    // -- Default policy -------------------------------------------------------

    #[test]
    fn default_policy_values() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }
}
