use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff shared by the queue's retry scheduling and the extractor's HTTP retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Same delay as a `chrono::Duration`, for computing `next_attempt_at` columns.
    pub fn chrono_delay_for_attempt(&self, attempt_index: usize) -> chrono::Duration {
        chrono::Duration::from_std(self.delay_for_attempt(attempt_index))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy::new(5, Duration::from_secs(30), Duration::from_secs(100));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(100));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(100));
        assert_eq!(policy.chrono_delay_for_attempt(1), chrono::Duration::seconds(60));
    }
}
