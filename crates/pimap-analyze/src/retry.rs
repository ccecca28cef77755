//! PIMAP Retry Policy
//!
//! Bounded exponential backoff for transient store failures. Only errors
//! classified as transient are retried; the first permanent error ends the
//! loop immediately. Cancellation is observed before every attempt and while
//! waiting out a backoff delay.
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use pimap_common::config::EngineConfig;
use pimap_common::{PimapError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Retry Policy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            config.retry_backoff_base(),
            config.retry_backoff_max(),
        )
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

// =============================================================================
// Retry Loop
// =============================================================================

/// Outcome of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy or is
/// cancelled. `op` receives the 1-based attempt number.
///
/// Exhaustion is reported as `RetriesExhausted`, which is permanent.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Attempted {
                result: Err(PimapError::Cancelled),
                attempts: attempt,
            };
        }

        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };

        if !err.is_transient() {
            return Attempted {
                result: Err(err),
                attempts: attempt,
            };
        }

        if attempt >= policy.max_attempts {
            return Attempted {
                result: Err(PimapError::RetriesExhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                }),
                attempts: attempt,
            };
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(attempt, ?delay, error = %err, "transient failure, retrying");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Attempted {
                    result: Err(PimapError::Cancelled),
                    attempts: attempt,
                };
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
