//! Bounded exponential-backoff retry with jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::ApiError;

/// Immutable retry configuration. Not mutated at runtime; pick a preset per
/// operation category.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Additional attempts after the first, so `max_retries + 1` total
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub backoff_multiplier: f64,
  /// Uniform random extra delay in `[0, jitter]` added to every backoff
  pub jitter: Duration,
}

impl RetryPolicy {
  /// Default policy for read paths.
  pub fn reads() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(200),
      max_delay: Duration::from_secs(5),
      backoff_multiplier: 2.0,
      jitter: Duration::from_millis(250),
    }
  }

  /// Default policy for create/update.
  pub fn writes() -> Self {
    Self {
      max_retries: 2,
      base_delay: Duration::from_millis(300),
      max_delay: Duration::from_secs(4),
      backoff_multiplier: 2.0,
      jitter: Duration::from_millis(250),
    }
  }

  /// Single attempt, no backoff. Used for delete: retrying a delete risks
  /// duplicate side effects, so a failed delete surfaces instead.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
      backoff_multiplier: 1.0,
      jitter: Duration::ZERO,
    }
  }

  #[cfg(test)]
  pub fn test() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(10),
      backoff_multiplier: 2.0,
      jitter: Duration::from_millis(2),
    }
  }

  /// Backoff before the retry that follows a failed attempt (0-indexed):
  /// `min(base * multiplier^attempt, max) + random(0..=jitter)`.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let base_ms = self.base_delay.as_millis() as f64;
    let max_ms = self.max_delay.as_millis() as f64;
    let backoff = (base_ms * self.backoff_multiplier.powi(attempt as i32)).min(max_ms);

    let jitter_ms = self.jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
      0
    } else {
      rand::rng().random_range(0..=jitter_ms)
    };

    Duration::from_millis(backoff as u64 + jitter)
  }
}

/// Executes operations under a [`RetryPolicy`].
///
/// Purely a scheduling policy: it never inspects error kinds, never
/// transforms errors, and re-throws the last error unchanged once the
/// attempt budget is spent. Which failures deserve retries at all is decided
/// by the caller's choice of policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryManager;

impl RetryManager {
  pub fn new() -> Self {
    Self
  }

  /// Run `operation` up to `max_retries + 1` times. `context` is an opaque
  /// label used only for logging.
  pub async fn execute<T, F, Fut>(
    &self,
    policy: &RetryPolicy,
    context: &str,
    mut operation: F,
  ) -> Result<T, ApiError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    let mut attempt = 0u32;
    loop {
      match operation().await {
        Ok(value) => return Ok(value),
        Err(err) => {
          if attempt >= policy.max_retries {
            return Err(err);
          }

          let delay = policy.delay_for_attempt(attempt);
          warn!(
            context,
            attempt = attempt + 1,
            budget = policy.max_retries + 1,
            error = %err,
            "operation failed, retrying in {:?}",
            delay
          );
          sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }
}
