use std::time::Duration;

use huddle_core::config::ReconnectConfig;

/// When to retry after losing an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    increment: Duration,
    ceiling: Duration,
    window: Duration,
}

impl ReconnectPolicy {
    pub fn new(increment: Duration, ceiling: Duration, window: Duration) -> Self {
        Self {
            increment,
            ceiling: ceiling.max(increment),
            window,
        }
    }

    /// Delay before the retry following `previous_retries` failed ones, or
    /// `None` once `elapsed` since the loss has used up the retry window.
    pub fn next_delay(&self, previous_retries: u32, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.window {
            return None;
        }
        let delay = self
            .increment
            .saturating_mul(previous_retries.saturating_add(1))
            .min(self.ceiling);
        Some(delay)
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.increment_ms),
            Duration::from_millis(config.ceiling_ms),
            Duration::from_secs(config.window_seconds),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_grows_by_increment_and_caps_at_ceiling() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..8)
            .map(|retry| {
                policy
                    .next_delay(retry, Duration::ZERO)
                    .expect("inside window")
                    .as_secs()
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 3, 4, 5, 5, 5, 5]);
    }

    #[test]
    fn stops_once_window_is_used_up() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.next_delay(3, Duration::from_millis(59_999)),
            Some(Duration::from_secs(4))
        );
        assert_eq!(policy.next_delay(3, Duration::from_secs(60)), None);
        assert_eq!(policy.next_delay(0, Duration::from_secs(600)), None);
    }

    #[test]
    fn huge_retry_counts_saturate() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.next_delay(u32::MAX, Duration::ZERO),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn ceiling_never_below_increment() {
        let policy = ReconnectPolicy::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );
        assert_eq!(
            policy.next_delay(0, Duration::ZERO),
            Some(Duration::from_secs(2))
        );
    }
}
