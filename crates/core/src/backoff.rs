//! Exponential reconnect backoff with a ceiling.
//!
//! [`Backoff`] tracks the delay to wait before the next reconnect
//! attempt. The caller sleeps for [`Backoff::current`], then calls
//! [`Backoff::advance`] before trying again. A successful connection
//! calls [`Backoff::reset`] to drop back to the floor.

use std::time::Duration;

/// Floor and ceiling for the reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

/// Double `current`, clamped to `max`.
pub fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Stateful reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grow the delay after a wait has elapsed.
    pub fn advance(&mut self) {
        self.current = next_delay(self.current, self.config.max_delay);
    }

    /// Return to the floor after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let d = next_delay(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let d = next_delay(Duration::from_secs(8), Duration::from_secs(10));
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn consecutive_failures_follow_doubling_sequence() {
        let mut backoff = Backoff::default();
        let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];

        for &ms in &expected {
            assert_eq!(backoff.current(), Duration::from_millis(ms));
            backoff.advance();
        }
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut backoff = Backoff::default();
        backoff.advance();
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(4_000));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(1_000));
    }

    #[test]
    fn custom_floor_and_ceiling() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(600),
        });
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(500));
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(600));
    }
}
