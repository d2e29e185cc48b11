//! Exponential backoff with a cap.
//!
//! `Backoff` is deterministic: callers that want jitter add it on top.

use std::time::Duration;

/// Delay schedule `min(base * 2^n, max)`, where `n` counts calls since the last reset.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Returns the next delay and advances the attempt counter.
    pub fn next(&mut self) -> Duration {
        let delay = delay_for(self.base, self.max, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// `min(base * 2^attempt, max)` without overflowing for large attempt counts.
pub fn delay_for(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let seen: Vec<u64> = (0..6).map(|_| backoff.next().as_secs()).collect();
        assert_eq!(seen, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn reset_restarts_at_base() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(500));
    }

    #[test]
    fn huge_attempt_counts_saturate_at_max() {
        let max = Duration::from_secs(30);
        assert_eq!(delay_for(Duration::from_secs(1), max, 200), max);
        assert_eq!(delay_for(Duration::ZERO, max, 200), Duration::ZERO);
    }
}
