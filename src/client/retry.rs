//! Retry scheduling for the HTTP client.
//!
//! Classification lives on `MigrateError`; this module only decides whether
//! another attempt is allowed and how long to wait before it. Rate-limit
//! responses honor the server's `Retry-After` hint; everything else backs off
//! exponentially. Every wait is capped so a misbehaving server cannot park a
//! worker indefinitely.

use std::time::Duration;

use crate::errors::MigrateError;

/// Ceiling for any single wait, hint-provided or computed.
pub const MAX_BACKOFF_SECONDS: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Decide the wait before the next attempt, or `None` when the error is
    /// terminal or the attempt budget is spent. `attempt` counts completed
    /// attempts, starting at 0.
    pub fn delay_for(&self, error: &MigrateError, attempt: u32) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        // Non-5xx statuses land in the Server variant but are client
        // mistakes the server will keep rejecting.
        if let MigrateError::Server { status, .. } = error {
            if *status < 500 {
                return None;
            }
        }
        if let MigrateError::RateLimited {
            retry_after: Some(hint),
            ..
        } = error
        {
            let capped = hint.min(MAX_BACKOFF_SECONDS).max(0.0);
            return Some(Duration::from_secs_f64(capped));
        }
        Some(self.backoff_delay(attempt))
    }

    /// Exponential backoff for the given completed-attempt count, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64();
        let raw = base * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(MAX_BACKOFF_SECONDS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limited(hint: Option<f64>) -> MigrateError {
        MigrateError::RateLimited {
            endpoint: "/datasets".into(),
            retry_after: hint,
        }
    }

    fn server(status: u16) -> MigrateError {
        MigrateError::Server {
            endpoint: "/datasets".into(),
            status,
            detail: "boom".into(),
        }
    }

    #[test]
    fn test_honors_retry_after_hint() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(&rate_limited(Some(2.0)), 0).unwrap();
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn test_caps_retry_after_hint() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(&rate_limited(Some(600.0)), 0).unwrap();
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(&server(503), 0).is_some());
        assert!(policy.delay_for(&server(503), 1).is_some());
        assert!(policy.delay_for(&server(503), 2).is_none());
    }

    #[test]
    fn test_client_errors_never_retried() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(&server(422), 0).is_none());
        assert!(
            policy
                .delay_for(&MigrateError::conflict("/examples/bulk", "dup"), 0)
                .is_none()
        );
        assert!(
            policy
                .delay_for(&MigrateError::protocol("/datasets", "bad json"), 0)
                .is_none()
        );
    }

    #[test]
    fn test_patch_policy_single_attempt() {
        let policy = RetryPolicy::with_attempts(1);
        assert!(policy.delay_for(&server(503), 0).is_none());
    }
}
