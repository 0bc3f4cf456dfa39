//! Capped exponential reconnect backoff.

use crate::config::ReconnectConfig;
use std::time::Duration;

/// Tracks consecutive reconnect attempts for one channel.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// A policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            attempt: 0,
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    ///
    /// `min(base * 2^attempt, max)`; consumes one attempt.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        self.attempt += 1;
        Some(delay)
    }

    /// Start over after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Prevent any further attempts (deliberate disconnect).
    pub fn suppress(&mut self) {
        self.attempt = self.max_attempts;
    }

    /// Attempts consumed since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether this policy reconnects at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn default_sequence_doubles_and_stops_after_five() {
        let mut policy = ReconnectPolicy::new(&ReconnectConfig::default());
        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay()).collect();
        assert_eq!(delays, ms(&[1000, 2000, 4000, 8000, 16000]));
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn delays_are_capped() {
        let mut policy = ReconnectPolicy::new(&ReconnectConfig {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 8,
        });
        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay()).collect();
        assert_eq!(
            delays,
            ms(&[1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000])
        );
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut policy = ReconnectPolicy::new(&ReconnectConfig::default());
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn suppress_exhausts_policy() {
        let mut policy = ReconnectPolicy::new(&ReconnectConfig::default());
        policy.suppress();
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt(), 5);
    }

    #[test]
    fn disabled_policy_never_retries() {
        let mut policy = ReconnectPolicy::disabled();
        assert!(!policy.is_enabled());
        assert_eq!(policy.next_delay(), None);
    }
}
