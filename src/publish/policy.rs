//! Reconnect backoff and health failure accounting

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Reconnect policy state
///
/// Backoff is linear: each failed attempt adds a fixed increment to the
/// delay, capped at the configured maximum. A success or a healthy check
/// puts everything back to the initial values.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    increment: Duration,
    max_delay: Duration,
    max_attempts: u32,
    health_ceiling: u32,

    attempts: u32,
    current_delay: Duration,
    health_failures: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &ConnectionConfig) -> Self {
        let initial_delay = Duration::from_millis(config.initial_reconnect_delay_ms);
        Self {
            initial_delay,
            increment: Duration::from_millis(config.reconnect_delay_increment_ms),
            max_delay: Duration::from_millis(config.max_reconnect_delay_ms).max(initial_delay),
            max_attempts: config.max_reconnect_attempts,
            health_ceiling: config.health_failure_ceiling.max(1),
            attempts: 0,
            current_delay: initial_delay,
            health_failures: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn health_failures(&self) -> u32 {
        self.health_failures
    }

    /// Claim the next reconnect attempt
    ///
    /// Returns the attempt number (1-based) and the delay to wait first, or
    /// `None` once the attempt budget is spent.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some((self.attempts, self.current_delay))
    }

    /// A connect cycle failed: grow the delay
    pub fn record_attempt_failure(&mut self) {
        self.current_delay = (self.current_delay + self.increment).min(self.max_delay);
    }

    /// Count one unhealthy check; true when the ceiling is reached
    pub fn record_health_failure(&mut self) -> bool {
        self.health_failures = self.health_failures.saturating_add(1);
        self.health_failures >= self.health_ceiling
    }

    /// A connect cycle succeeded or a health check passed
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.initial_delay;
        self.health_failures = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            max_reconnect_attempts: max_attempts,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_grows_until_cap_then_resets() {
        let mut policy = ReconnectPolicy::new(&config(10));
        let mut delays = Vec::new();
        while let Some((_, delay)) = policy.next_attempt() {
            delays.push(delay.as_secs());
            policy.record_attempt_failure();
        }
        assert_eq!(delays, vec![8, 12, 16, 20, 24, 28, 30, 30, 30, 30]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        policy.reset();
        assert_eq!(policy.current_delay(), Duration::from_secs(8));
        assert_eq!(policy.next_attempt(), Some((1, Duration::from_secs(8))));
    }

    #[test]
    fn test_attempt_budget() {
        let mut policy = ReconnectPolicy::new(&config(2));
        assert_eq!(policy.next_attempt().map(|a| a.0), Some(1));
        policy.record_attempt_failure();
        assert_eq!(policy.next_attempt().map(|a| a.0), Some(2));
        policy.record_attempt_failure();
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_attempt(), None);
    }

    #[test]
    fn test_health_ceiling_and_full_reset() {
        let mut policy = ReconnectPolicy::new(&config(2));
        for _ in 0..4 {
            assert!(!policy.record_health_failure());
        }
        policy.reset();
        assert_eq!(policy.health_failures(), 0);
        // no partial credit: five more in a row are needed
        for _ in 0..4 {
            assert!(!policy.record_health_failure());
        }
        assert!(policy.record_health_failure());
    }
}
