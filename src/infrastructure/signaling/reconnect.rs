//! Retry policies for the hub connection

use rand::Rng;
use std::time::Duration;

/// Delays before each automatic reconnect attempt after a dropped
/// connection. Once the list is exhausted the connection closes for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_millis).collect())
    }

    /// Never reconnect automatically
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Delay before attempt number `attempt` (0-indexed), or `None` when
    /// the policy gives up
    pub fn next_delay(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_millis(&[0, 2000, 10000, 30000])
    }
}

/// Fixed-interval retry for the initial connection, with up to 10% jitter
/// so clients restarted together do not hit the relay in lockstep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRetry {
    pub interval: Duration,
    /// 0 means unlimited
    pub max_attempts: u32,
}

impl ConnectRetry {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Whether another attempt may follow `attempts` failed ones
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        let jitter_ms = self.interval.as_millis() as u64 / 10;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(0), Some(Duration::ZERO));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.next_delay(4), None);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_disabled_policy_gives_up_at_once() {
        assert_eq!(ReconnectPolicy::disabled().next_delay(0), None);
    }

    #[test]
    fn test_connect_retry_bounds() {
        let retry = ConnectRetry::new(Duration::from_millis(1000), 3);
        assert!(retry.should_retry(2));
        assert!(!retry.should_retry(3));

        for _ in 0..20 {
            let delay = retry.delay();
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1100));
        }

        assert!(ConnectRetry::default().should_retry(1_000));
    }
}
