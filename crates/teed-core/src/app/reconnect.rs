//! Reconnect policy: bounded retries with exponential backoff.

use std::time::Duration;

/// What to do when the broker connection drops mid-run.
///
/// `max_attempts == 0` turns reconnection off: a lost connection stops the
/// worker with an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,

    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,

    pub multiplier: f64,

    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Is reconnect attempt number `attempt` (1-indexed) allowed?
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// delay = base_delay * multiplier^(attempt - 1), capped at max_delay.
    ///
    /// With base=1s, multiplier=2.0, max=30s:
    /// 1s, 2s, 4s, 8s, 16s, 30s, 30s, ...
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exp);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert!(policy.is_enabled());
    }

    #[test]
    fn exponential_backoff_increases_until_cap() {
        let policy = ReconnectPolicy::default();

        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
        assert_eq!(policy.next_delay(6), Duration::from_secs(30));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        };
        assert!(!policy.allows(0));
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn disabled_allows_nothing() {
        let policy = ReconnectPolicy::disabled();
        assert!(!policy.is_enabled());
        assert!(!policy.allows(1));
    }
}
