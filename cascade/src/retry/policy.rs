//! Retry policy and backoff math.

use crate::errors::CascadeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Per-call retry policy.
///
/// The delay before re-attempting a record is `delay * backoff^attemptCount`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Attempts after which a record becomes permanent.
    pub max_retries: u32,
    /// Base delay in milliseconds.
    #[serde(rename = "delay")]
    pub delay_ms: u64,
    /// Multiplier applied per attempt (at least 1).
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 2_000,
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks the policy bounds.
    pub fn validate(&self) -> Result<(), CascadeError> {
        if !self.backoff.is_finite() || self.backoff < 1.0 {
            return Err(CascadeError::validation(format!(
                "backoff must be a finite number >= 1, got {}",
                self.backoff
            )));
        }
        Ok(())
    }

    /// Backoff delay before the attempt following `attempt_count` attempts.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
        let millis = self.delay_ms as f64 * self.backoff.powi(exponent);
        let capped = millis.min(MAX_BACKOFF.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_for(0), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(4_000));
    }

    #[test]
    fn test_delays_double() {
        let policy = RetryPolicy::new().with_delay_ms(100).with_backoff(2.0);
        let delays: Vec<_> = (0..3).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new().with_backoff(10.0);
        assert_eq!(policy.delay_for(50), MAX_BACKOFF);
    }

    #[test]
    fn test_validate_backoff() {
        assert!(RetryPolicy::new().with_backoff(1.0).validate().is_ok());
        assert!(RetryPolicy::new().with_backoff(0.5).validate().is_err());
        assert!(RetryPolicy::new().with_backoff(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"maxRetries":5,"delay":10}"#).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay_ms, 10);
        assert!((policy.backoff - 2.0).abs() < f64::EPSILON);
    }
}
