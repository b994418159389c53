//! Connection pool configuration types.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

use super::reconnect::{BackoffPolicy, LinearPolicy, ReconnectionPolicy};

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PoolConfig {
    /// Upper bound on idle plus active members.
    pub max_pool_size: usize,
    /// Members kept alive even when nobody uses them.
    pub min_pool_size: usize,
    /// Bound on acquisition waits and on every session-level call.
    pub connection_timeout: Duration,
    /// Period of the idle-member health check.
    pub health_check_interval: Duration,
    /// Retries per reconnection sequence, and the validation failure threshold.
    pub max_retry_attempts: u32,
    /// Use exponential backoff for recovery instead of a fixed interval.
    pub enable_backoff_retry: bool,
    /// First backoff wait.
    pub initial_wait: Duration,
    /// Backoff multiplier.
    pub backoff_factor: f64,
    /// Fixed wait of the linear policy.
    pub retry_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            min_pool_size: 1,
            connection_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
            max_retry_attempts: 3,
            enable_backoff_retry: true,
            initial_wait: Duration::from_secs(1),
            backoff_factor: 2.0,
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Check the invariants the pool relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(PoolError::invalid_config("max_pool_size must be greater than 0"));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(PoolError::invalid_config(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.connection_timeout.is_zero() {
            return Err(PoolError::invalid_config("connection_timeout must be non-zero"));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::invalid_config("health_check_interval must be non-zero"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(PoolError::invalid_config(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Recovery policy used when an idle member fails validation.
    pub fn reconnection_policy(&self) -> ReconnectionPolicy {
        if self.enable_backoff_retry {
            ReconnectionPolicy::Backoff(BackoffPolicy {
                initial_wait: self.initial_wait,
                backoff_factor: self.backoff_factor,
                max_retries: self.max_retry_attempts,
            })
        } else {
            ReconnectionPolicy::Linear(LinearPolicy {
                retry_interval: self.retry_interval,
                max_retries: self.max_retry_attempts,
            })
        }
    }

    /// Set the maximum pool size.
    pub fn with_max_pool_size(mut self, max: usize) -> Self {
        self.max_pool_size = max;
        self
    }

    /// Set the minimum pool size.
    pub fn with_min_pool_size(mut self, min: usize) -> Self {
        self.min_pool_size = min;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the health check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the retry count and validation failure threshold.
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Choose between backoff and linear recovery.
    pub fn with_backoff_retry(mut self, enabled: bool) -> Self {
        self.enable_backoff_retry = enabled;
        self
    }

    /// Set the backoff schedule.
    pub fn with_backoff(mut self, initial_wait: Duration, factor: f64) -> Self {
        self.initial_wait = initial_wait;
        self.backoff_factor = factor;
        self
    }

    /// Set the linear retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.min_pool_size, 1);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let config = PoolConfig::default().with_min_pool_size(5).with_max_pool_size(2);
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));

        let config = PoolConfig::default().with_min_pool_size(0).with_max_pool_size(0);
        assert!(config.validate().is_err());

        let config = PoolConfig::default().with_connection_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = PoolConfig::default().with_backoff(Duration::from_secs(1), 0.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnection_policy_selection() {
        let config = PoolConfig::default();
        match config.reconnection_policy() {
            ReconnectionPolicy::Backoff(p) => {
                assert_eq!(p.initial_wait, Duration::from_secs(1));
                assert_eq!(p.max_retries, 3);
            }
            other => panic!("expected backoff, got {other:?}"),
        }

        let config = PoolConfig::default()
            .with_backoff_retry(false)
            .with_retry_interval(Duration::from_millis(250));
        assert_eq!(
            config.reconnection_policy(),
            ReconnectionPolicy::Linear(LinearPolicy {
                retry_interval: Duration::from_millis(250),
                max_retries: 3,
            })
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_config_deserializes() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"max_pool_size": 4, "enable_backoff_retry": false}"#).unwrap();
        assert_eq!(config.max_pool_size, 4);
        assert!(!config.enable_backoff_retry);
        assert_eq!(config.min_pool_size, 1);
    }
}
