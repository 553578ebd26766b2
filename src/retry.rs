//! Retry with exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::FetchError;

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts including the first one
  pub max_attempts: u32,
  /// Delay after the first failure; doubles after each subsequent one
  pub base_delay: Duration,
  /// Upper bound on any single delay
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// A policy that tries exactly once.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Delay to wait after failed attempt number `attempt` (1-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    self
      .base_delay
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only [`FetchError::is_retryable`] errors are retried. The error from the
/// last attempt is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, FetchError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, FetchError>>,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 0;

  loop {
    attempt += 1;
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
      Err(e) => {
        let delay = policy.delay_for(attempt);
        debug!(attempt, max_attempts, ?delay, error = %e, "transient failure, backing off");
        tokio::time::sleep(delay).await;
      }
    }
  }
}
