//! Bounded exponential backoff with full jitter
//!
//! Attempt `n` (1-based) sleeps a uniformly random duration in
//! `0..=min(max, base * 2^(n-1))`.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Upper bound of the delay after failed attempt `attempt` (1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let ceiling_ms = (self.base.as_millis() as u64).saturating_mul(1u64 << shift);
        Duration::from_millis(ceiling_ms.min(self.max.as_millis() as u64))
    }

    /// Jittered delay after failed attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(5000));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(1000));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(2000));
        assert_eq!(backoff.ceiling(5), Duration::from_millis(5000));
        assert_eq!(backoff.ceiling(200), Duration::from_millis(5000));
    }

    #[test]
    fn test_delay_within_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        for attempt in 1..=6 {
            for _ in 0..50 {
                assert!(backoff.delay(attempt) <= backoff.ceiling(attempt));
            }
        }
    }

    #[test]
    fn test_zero_base_never_sleeps() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }
}
