use std::time::Duration;

use crate::config::SyncSettings;

/// Exponential backoff for transient remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            base: settings.backoff_base,
            cap: settings.backoff_cap,
            max_retries: settings.max_retries,
        }
    }

    /// Delay before the retry that follows attempt number `retry_count` (zero-based).
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    #[must_use]
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (0..5).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn huge_retry_counts_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(64), Duration::from_secs(4));
        assert!(!policy.should_retry(3));
        assert!(policy.should_retry(2));
    }
}
