//! Reconnection policies.
//!
//! Two independent schedules drive one retry loop. A policy with
//! `max_retries = n` makes up to `n + 1` attempts: the first fires at once and
//! every retry waits first.
//!
//! | Policy | Wait before attempt `k` (k >= 2) |
//! |---|---|
//! | [`BackoffPolicy`] | `initial_wait * backoff_factor^(k - 2)` |
//! | [`LinearPolicy`] | `retry_interval` |

use std::future::Future;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct BackoffPolicy {
    /// Wait before the first retry.
    pub initial_wait: Duration,
    /// Multiplier applied to the wait after every failed retry.
    pub backoff_factor: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(1000),
            backoff_factor: 2.0,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Set the first wait.
    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    /// Set the multiplier.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    fn wait_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_wait.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Fixed-interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct LinearPolicy {
    /// Wait before every retry.
    pub retry_interval: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for LinearPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(5000),
            max_retries: 3,
        }
    }
}

impl LinearPolicy {
    /// Set the interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// How a connection recovers after losing its session.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum ReconnectionPolicy {
    /// Exponential backoff.
    Backoff(BackoffPolicy),
    /// Fixed interval.
    Linear(LinearPolicy),
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        ReconnectionPolicy::Backoff(BackoffPolicy::default())
    }
}

impl From<BackoffPolicy> for ReconnectionPolicy {
    fn from(policy: BackoffPolicy) -> Self {
        ReconnectionPolicy::Backoff(policy)
    }
}

impl From<LinearPolicy> for ReconnectionPolicy {
    fn from(policy: LinearPolicy) -> Self {
        ReconnectionPolicy::Linear(policy)
    }
}

/// Result of one attempt inside a reconnection sequence.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The connection reached `Connected`.
    Connected,
    /// The attempt finished cleanly without connecting.
    NotConnected,
    /// The attempt raised an error.
    Errored(PoolError),
    /// The target went away for good. No further attempts are made.
    Abandoned(PoolError),
}

/// Final result of a reconnection sequence.
#[derive(Debug)]
pub enum ReconnectOutcome {
    /// Connected on attempt `attempts`.
    Reconnected {
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// How many of them raised an error rather than failing cleanly.
        errors: u32,
        /// The most recent error, if any attempt raised one.
        last_error: Option<PoolError>,
    },
}

impl ReconnectOutcome {
    /// Check whether the sequence ended connected.
    pub fn is_success(&self) -> bool {
        matches!(self, ReconnectOutcome::Reconnected { .. })
    }

    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            ReconnectOutcome::Reconnected { attempts } => *attempts,
            ReconnectOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Convert into a `Result`, mapping exhaustion to `ReconnectionExhausted`.
    pub fn into_result(self) -> Result<u32> {
        match self {
            ReconnectOutcome::Reconnected { attempts } => Ok(attempts),
            ReconnectOutcome::Exhausted { attempts, .. } => {
                Err(PoolError::ReconnectionExhausted { attempts })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryPhase {
    Attempting(u32),
    Waiting(u32),
    Succeeded(u32),
    Exhausted(u32),
}

impl ReconnectionPolicy {
    /// Retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        match self {
            ReconnectionPolicy::Backoff(p) => p.max_retries,
            ReconnectionPolicy::Linear(p) => p.max_retries,
        }
    }

    /// Total attempts of one sequence.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries().saturating_add(1)
    }

    /// Wait before attempt `attempt` (1-based). The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self {
            ReconnectionPolicy::Backoff(p) => p.wait_for_retry(attempt - 2),
            ReconnectionPolicy::Linear(p) => p.retry_interval,
        }
    }

    /// Drive `attempt` until it connects or the policy runs out of attempts.
    ///
    /// `attempt` receives the 1-based attempt number. Waits between attempts
    /// suspend the task without blocking a thread.
    pub async fn run<F, Fut>(&self, label: &str, mut attempt: F) -> ReconnectOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome>,
    {
        let max_attempts = self.max_attempts();
        let mut errors = 0;
        let mut last_error = None;
        let mut phase = RetryPhase::Attempting(1);

        loop {
            phase = match phase {
                RetryPhase::Attempting(n) => {
                    tracing::debug!(
                        target_id = label,
                        attempt = n,
                        max_attempts,
                        "reconnection attempt"
                    );
                    let mut abandoned = false;
                    let connected = match attempt(n).await {
                        AttemptOutcome::Connected => true,
                        AttemptOutcome::NotConnected => false,
                        AttemptOutcome::Errored(err) => {
                            tracing::warn!(
                                target_id = label,
                                attempt = n,
                                error = %err,
                                "reconnection attempt errored"
                            );
                            errors += 1;
                            last_error = Some(err);
                            false
                        }
                        AttemptOutcome::Abandoned(err) => {
                            tracing::info!(
                                target_id = label,
                                attempt = n,
                                error = %err,
                                "reconnection abandoned"
                            );
                            errors += 1;
                            last_error = Some(err);
                            abandoned = true;
                            false
                        }
                    };
                    if connected {
                        RetryPhase::Succeeded(n)
                    } else if n < max_attempts && !abandoned {
                        RetryPhase::Waiting(n + 1)
                    } else {
                        RetryPhase::Exhausted(n)
                    }
                }
                RetryPhase::Waiting(n) => {
                    let delay = self.delay_before(n);
                    tracing::debug!(
                        target_id = label,
                        next_attempt = n,
                        ?delay,
                        "waiting before retry"
                    );
                    tokio::time::sleep(delay).await;
                    RetryPhase::Attempting(n)
                }
                RetryPhase::Succeeded(n) => {
                    tracing::info!(target_id = label, attempts = n, "reconnected");
                    return ReconnectOutcome::Reconnected { attempts: n };
                }
                RetryPhase::Exhausted(n) => {
                    tracing::warn!(
                        target_id = label,
                        attempts = n,
                        errors,
                        "reconnection exhausted"
                    );
                    return ReconnectOutcome::Exhausted {
                        attempts: n,
                        errors,
                        last_error,
                    };
                }
            };
        }
    }
}
