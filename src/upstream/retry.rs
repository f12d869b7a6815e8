//! Retry policy for upstream attempts: exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether the failover walk may continue after this error.
    pub fn should_retry(&self, error: &GatewayError) -> bool {
        error.is_retryable()
    }

    /// Delay before attempt `attempt` (0-based), jittered.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = Duration::from_millis(base as u64).min(self.max_delay);
        if self.jitter_factor <= 0.0 {
            return capped;
        }
        let spread = capped.as_millis() as f64 * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((capped.as_millis() as f64 + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy { jitter_factor: 0.0, ..Default::default() };
        let d0 = policy.calculate_delay(0);
        let d1 = policy.calculate_delay(1);
        let d10 = policy.calculate_delay(10);
        assert!(d1 > d0);
        assert_eq!(d10, policy.max_delay);
    }

    #[test]
    fn retry_follows_error_whitelist() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&GatewayError::Upstream5xx {
            status: 503,
            message: String::new()
        }));
        assert!(!policy.should_retry(&GatewayError::BadRequest("x".into())));
    }
}
