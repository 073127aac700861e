use std::time::Duration;

/// Exponential backoff schedule for retryable client failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up on the first failure.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0 = first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
        }
    }
}

/// Tracks the retries spent on one operation.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    /// The delay to wait before the next attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries + 1 >= self.policy.max_attempts.max(1) {
            return None;
        }
        let delay = self.policy.delay(self.retries);
        self.retries += 1;
        Some(delay)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2,
        };

        let delays: Vec<_> = (0..5).map(|retry| policy.delay(retry).as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 500, 500]);
    }

    #[test]
    fn backoff_stops_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let mut backoff = policy.backoff();

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.retries(), 2);
    }

    #[test]
    fn never_does_not_retry() {
        assert_eq!(RetryPolicy::never().backoff().next_delay(), None);
    }

    #[test]
    fn huge_exponents_saturate_instead_of_overflowing() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(u32::MAX), policy.max_backoff);
    }
}
