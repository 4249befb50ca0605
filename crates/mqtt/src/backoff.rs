//! Reconnect backoff for the connection kernel.
//!
//! The delay starts at the configured initial value, doubles after every failed
//! attempt and never exceeds the ceiling:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With the defaults (5s, x2, 60s) consecutive failures sleep 5s, 10s, 20s, 40s,
//! 60s, 60s, ... A successful connect calls [`Backoff::reset`], so the next
//! outage starts from 5s again.
//!
//! ```ignore
//! let mut backoff = Backoff::default();
//! assert_eq!(backoff.next_sleep()?, Duration::from_secs(5));
//! assert_eq!(backoff.next_sleep()?, Duration::from_secs(10));
//! backoff.reset();
//! assert_eq!(backoff.next_sleep()?, Duration::from_secs(5));
//! ```

use std::time::Duration;

use thiserror::Error;

/// Default first delay after a failed connect.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Default ceiling for the reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default growth factor between attempts.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Raised when an explicit attempt limit has been configured and exhausted.
#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Exponential backoff controller.
///
/// Attempts are unlimited unless [`Backoff::set_max_attempts`] is called; the
/// agent is expected to keep retrying for as long as it runs.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Creates a backoff with custom timing.
    ///
    /// A multiplier below `1.0` is clamped to `1.0` (constant delay) and an
    /// initial delay above the ceiling is clamped to the ceiling.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier: multiplier.max(1.0),
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Gives up after `max` consecutive failures.
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Returns to the initial delay. Called on every successful connect.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the delay to sleep before the next attempt and advances the schedule.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt = self.attempt.saturating_add(1);

        if let Some(limit) = self.max_attempts {
            if self.attempt > limit {
                return Err(BackoffError::MaxAttemptLimitError(limit));
            }
        }

        let sleep = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        Ok(sleep)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Number of failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay that the next call to [`Backoff::next_sleep`] will return.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_default_creation() {
        let backoff = Backoff::default();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_secs(5));
        assert_eq!(backoff.max_delay(), Duration::from_secs(60));
        assert!(backoff.max_attempts().is_none());
    }

    #[test]
    fn test_three_failures_double_from_five_seconds() {
        let mut backoff = Backoff::default();

        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(10));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_caps_at_sixty_seconds() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = (0..8).map(|_| backoff.next_sleep().unwrap()).collect();

        assert_eq!(delays[3], Duration::from_secs(40));
        assert_eq!(delays[4], Duration::from_secs(60));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        assert_eq!(delays[7], Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_reset_after_connect() {
        let mut backoff = Backoff::default();

        backoff.next_sleep().unwrap();
        backoff.next_sleep().unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_unlimited_by_default() {
        let mut backoff = Backoff::default();
        for _ in 0..1000 {
            assert!(backoff.next_sleep().is_ok());
        }
    }

    #[test]
    fn test_backoff_max_attempts_exceeded() {
        let mut backoff = Backoff::default();
        backoff.set_max_attempts(2);

        let _ = backoff.next_sleep();
        let _ = backoff.next_sleep();
        let result = backoff.next_sleep();

        assert!(matches!(result, Err(BackoffError::MaxAttemptLimitError(2))));
    }

    #[test]
    fn test_backoff_edge_case_multiplier_below_one() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(10), 0.5);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(3));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_edge_case_initial_above_max() {
        let mut backoff = Backoff::new(Duration::from_secs(90), Duration::from_secs(60), 2.0);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(60));
    }
}
