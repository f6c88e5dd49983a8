//! Backoff for upstreams that are still loading a model.

use crate::config::RetryConfig;
use std::time::Duration;

/// Exponential backoff capped at `max_delay`, applied only to failures that
/// plausibly resolve on their own (the upstream reporting "model loading",
/// or a connect refusal right after a successful load).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    retry_on_model_loading: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs_f64(config.base_delay_seconds.max(0.0)),
            max_delay: Duration::from_secs_f64(config.max_delay_seconds.max(0.0)),
            retry_on_model_loading: config.retry_on_model_loading,
        }
    }

    pub fn max_retries(&self) -> u32 {
        if self.retry_on_model_loading {
            self.max_retries
        } else {
            0
        }
    }

    /// Delay before retry number `attempt` (0-based): `base · 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(31) as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_cap() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_retries: 5,
            base_delay_seconds: 1.0,
            max_delay_seconds: 5.0,
            retry_on_model_loading: true,
        });

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(5));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.max_retries(), 5);
    }

    #[test]
    fn disabled_policy_never_retries() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            retry_on_model_loading: false,
            ..RetryConfig::default()
        });
        assert_eq!(policy.max_retries(), 0);
    }

    #[test]
    fn fractional_base_delay() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_retries: 3,
            base_delay_seconds: 0.25,
            max_delay_seconds: 30.0,
            retry_on_model_loading: true,
        });
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
    }
}
