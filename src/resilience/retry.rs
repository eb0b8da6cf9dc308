use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::resilience::history::ErrorRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
            retryable_kinds: vec![
                ErrorKind::Network,
                ErrorKind::Api,
                ErrorKind::RateLimit,
                ErrorKind::Timeout,
            ],
        }
    }
}

/// Decides retry eligibility and computes backoff delays. Stateless: the
/// coordinator owns the resubmission loop and the sleeps.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: RetryConfig) {
        self.config = config;
    }

    pub fn should_retry(&self, record: &ErrorRecord) -> bool {
        if record.retry_count >= self.config.max_retries {
            return false;
        }

        if !self.config.retryable_kinds.contains(&record.kind) {
            return false;
        }

        // Auth failures never recover by retrying, whatever the config says.
        if record.kind == ErrorKind::Auth {
            return false;
        }

        true
    }

    /// `base * exponential_base^attempt`, tripled for rate limits, clamped
    /// to the max, then jittered by a uniform factor in [0.5, 1.0).
    pub fn next_delay(&self, record: &ErrorRecord) -> Duration {
        let mut delay_ms = self.config.base_delay_ms as f64
            * self.config.exponential_base.powi(record.retry_count as i32);

        if record.kind == ErrorKind::RateLimit {
            delay_ms *= 3.0;
        }

        delay_ms = delay_ms.min(self.config.max_delay_ms as f64);

        if self.config.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.0);
            delay_ms *= factor;
        }

        Duration::from_millis(delay_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::resilience::history::ErrorRecord;

    fn record_with(kind_message: &str, retry_count: u32) -> ErrorRecord {
        ErrorRecord::from_error(&Error::backend(kind_message), "p1", "m1", "req-1")
            .with_retry_count(retry_count)
    }

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_retryable_kinds() {
        let policy = no_jitter_policy();
        assert!(policy.should_retry(&record_with("connection refused", 0)));
        assert!(policy.should_retry(&record_with("503 server error", 0)));
        assert!(policy.should_retry(&record_with("429 too many requests", 0)));
        assert!(policy.should_retry(&record_with("request timed out", 0)));
    }

    #[test]
    fn test_auth_and_validation_never_retry() {
        let policy = no_jitter_policy();
        assert!(!policy.should_retry(&record_with("401 unauthorized", 0)));
        assert!(!policy.should_retry(&record_with("bad request: missing field", 0)));
    }

    #[test]
    fn test_auth_refused_even_when_listed_retryable() {
        let policy = RetryPolicy::new(RetryConfig {
            retryable_kinds: vec![ErrorKind::Auth],
            jitter: false,
            ..RetryConfig::default()
        });
        assert!(!policy.should_retry(&record_with("401 unauthorized", 0)));
    }

    #[test]
    fn test_retry_count_exhaustion() {
        let policy = no_jitter_policy();
        assert!(policy.should_retry(&record_with("connection refused", 2)));
        assert!(!policy.should_retry(&record_with("connection refused", 3)));
        assert!(!policy.should_retry(&record_with("connection refused", 4)));
    }

    #[test]
    fn test_exponential_delay_without_jitter() {
        let policy = no_jitter_policy();
        assert_eq!(
            policy.next_delay(&record_with("connection refused", 0)),
            Duration::from_secs(1)
        );
        assert_eq!(
            policy.next_delay(&record_with("connection refused", 1)),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.next_delay(&record_with("connection refused", 2)),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn test_rate_limit_delay_is_tripled() {
        // base 1s, exp 2, rate_limit x3: attempt 0 -> 3s, attempt 1 -> 6s
        let policy = no_jitter_policy();
        assert_eq!(
            policy.next_delay(&record_with("429 too many requests", 0)),
            Duration::from_secs(3)
        );
        assert_eq!(
            policy.next_delay(&record_with("429 too many requests", 1)),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 20,
            max_delay_ms: 5_000,
            jitter: false,
            ..RetryConfig::default()
        });
        assert_eq!(
            policy.next_delay(&record_with("connection refused", 10)),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.next_delay(&record_with("429 too many requests", 10)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_delay_non_decreasing_up_to_max() {
        let policy = no_jitter_policy();
        let mut previous = Duration::ZERO;
        for attempt in 0..10 {
            let delay = policy.next_delay(&record_with("connection refused", attempt));
            assert!(delay >= previous, "attempt {}", attempt);
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let record = record_with("connection refused", 2); // 4s before jitter
        for _ in 0..50 {
            let delay = policy.next_delay(&record);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_secs(4));
        }
    }
}
