use std::time::Duration;

use crate::config::EngineConfig;

/// Reconnect schedule: `min(base * 2^attempt, cap)` for a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    /// Create a new backoff schedule
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.reconnect_backoff_base,
            config.reconnect_backoff_cap,
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the zero-based `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 already exceeds any sane cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|delay| delay.min(self.cap))
            .unwrap_or(self.cap)
    }

    /// Every delay of the schedule, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(move |attempt| self.delay(attempt))
    }

    /// Worst-case time spent sleeping before the session is closed
    pub fn total_delay(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_schedule() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3), 5);
        let delays: Vec<_> = backoff.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(backoff.total_delay(), Duration::from_millis(9500));
    }

    #[test]
    fn test_zero_attempts_has_no_delays() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0);
        assert_eq!(backoff.delays().count(), 0);
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 100);
        assert_eq!(backoff.delay(64), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn delay_is_bounded_and_monotonic(
            base_ms in 1u64..10_000,
            extra_ms in 0u64..120_000,
            attempt in 0u32..80,
        ) {
            let base = Duration::from_millis(base_ms);
            let cap = base + Duration::from_millis(extra_ms);
            let backoff = Backoff::new(base, cap, attempt + 1);

            let delay = backoff.delay(attempt);
            prop_assert!(delay >= base);
            prop_assert!(delay <= cap);
            prop_assert!(backoff.delay(attempt + 1) >= delay);
        }
    }
}
