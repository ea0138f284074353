//! Exponential backoff with jitter for navigation and rate-limit retries

use rand::Rng;
use std::time::Duration;

/// Hard ceiling on any single retry wait.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry delay policy: `base * 2^(attempt-1) + uniform(0, jitter)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Generic transient navigation errors (timeouts, resets).
    pub const NAVIGATION: Self = Self {
        base: Duration::from_millis(500),
        jitter: Duration::from_millis(250),
        cap: MAX_DELAY,
    };

    /// Explicit HTTP 429 responses.
    pub const RATE_LIMIT: Self = Self {
        base: Duration::from_millis(1000),
        jitter: Duration::from_millis(1000),
        cap: MAX_DELAY,
    };

    /// Delay before retry number `attempt` (1-based), using the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay with an explicit RNG, for seeded tests.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let scaled = self.scaled(attempt);

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };

        scaled.saturating_add(jitter).min(self.cap)
    }

    /// Longest total wait a caller making `attempts` tries can spend sleeping
    /// between them (full jitter on every wait).
    pub fn worst_case_total(&self, attempts: u32) -> Duration {
        (1..attempts.max(1))
            .map(|attempt| {
                self.scaled(attempt)
                    .saturating_add(self.jitter)
                    .min(self.cap)
            })
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    fn scaled(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        // 2^31 * base already exceeds any sane cap
        let factor = 1u32.checked_shl(exp.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    /// Delay honoring a server-supplied retry hint when present.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if !hint.is_zero() => hint.min(self.cap),
            _ => self.delay(attempt),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::NAVIGATION
    }
}

/// Parse a `Retry-After` header value given in whole seconds.
///
/// HTTP-date values are not honored and fall back to computed backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_first_attempt_is_base_plus_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let d = BackoffPolicy::NAVIGATION.delay_with(1, &mut rng);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(750));
        }
    }

    #[test]
    fn test_worst_case_total() {
        // waits before tries 2..=6: (1+1) + (2+1) + (4+1) + (8+1) + (16+1) seconds
        assert_eq!(
            BackoffPolicy::RATE_LIMIT.worst_case_total(6),
            Duration::from_secs(36)
        );
        assert_eq!(BackoffPolicy::RATE_LIMIT.worst_case_total(1), Duration::ZERO);
        assert_eq!(
            BackoffPolicy::RATE_LIMIT.worst_case_total(10),
            Duration::from_secs(36 + 33 + 60 + 60 + 60)
        );
    }

    #[test]
    fn test_delay_never_exceeds_cap() {
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..200 {
            for policy in [BackoffPolicy::NAVIGATION, BackoffPolicy::RATE_LIMIT] {
                assert!(policy.delay_with(attempt, &mut rng) <= MAX_DELAY);
            }
        }
    }

    #[test]
    fn test_delay_grows_with_attempt() {
        // Minimum of attempt n+1 is at least the maximum of attempt n once base
        // dominates jitter, so means are non-decreasing.
        let policy = BackoffPolicy::RATE_LIMIT;
        let mut rng = StdRng::seed_from_u64(3);
        let mean = |attempt: u32, rng: &mut StdRng| {
            let total: u128 = (0..500)
                .map(|_| policy.delay_with(attempt, rng).as_millis())
                .sum();
            total / 500
        };
        let mut prev = 0;
        for attempt in 1..10 {
            let m = mean(attempt, &mut rng);
            assert!(m >= prev, "attempt {} mean {} < {}", attempt, m, prev);
            prev = m;
        }
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let a = BackoffPolicy::RATE_LIMIT.delay_with(3, &mut StdRng::seed_from_u64(9));
        let b = BackoffPolicy::RATE_LIMIT.delay_with(3, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_retry_hint_overrides_and_is_capped() {
        let policy = BackoffPolicy::RATE_LIMIT;
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(600))),
            MAX_DELAY
        );
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("0"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
