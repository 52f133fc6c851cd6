//! Circuit breaker with an explicit three-state machine.
//!
//! One breaker guards one operation category (list, create, ...). Sharing a
//! breaker across unrelated operations would let unrelated failures trip
//! unrelated calls, so [`OperationCircuits`] hands out one per category.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ApiError;

/// Breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  /// Normal operation, calls pass through
  Closed,
  /// Failing fast, calls are rejected without touching the network
  Open,
  /// Recovery probe in progress, one call allowed through
  HalfOpen,
}

impl std::fmt::Display for CircuitState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Closed => write!(f, "closed"),
      Self::Open => write!(f, "open"),
      Self::HalfOpen => write!(f, "half-open"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
  /// In-window failures that trip the breaker
  pub failure_threshold: usize,
  /// Rolling window; failures older than this are pruned on each write
  pub monitoring_window: Duration,
  /// How long the breaker stays open before allowing a probe
  pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      monitoring_window: Duration::from_secs(60),
      recovery_timeout: Duration::from_secs(30),
    }
  }
}

impl CircuitBreakerConfig {
  #[cfg(test)]
  pub fn test() -> Self {
    Self {
      failure_threshold: 2,
      monitoring_window: Duration::from_secs(60),
      recovery_timeout: Duration::from_millis(100),
    }
  }
}

struct BreakerInner {
  state: CircuitState,
  /// Instants of recent failures, oldest first
  failures: VecDeque<Instant>,
  /// When an open breaker next admits a probe
  next_attempt_at: Option<Instant>,
  /// Guard so half-open admits exactly one concurrent probe
  probe_in_flight: bool,
}

/// Per-category circuit breaker.
pub struct CircuitBreaker {
  category: String,
  config: CircuitBreakerConfig,
  inner: Mutex<BreakerInner>,
}

enum Admission {
  Allow,
  Reject(Duration),
}

impl CircuitBreaker {
  pub fn new(category: impl Into<String>, config: CircuitBreakerConfig) -> Self {
    Self {
      category: category.into(),
      config,
      inner: Mutex::new(BreakerInner {
        state: CircuitState::Closed,
        failures: VecDeque::new(),
        next_attempt_at: None,
        probe_in_flight: false,
      }),
    }
  }

  pub fn category(&self) -> &str {
    &self.category
  }

  pub fn state(&self) -> CircuitState {
    self.inner.lock().expect("breaker lock poisoned").state
  }

  /// Failures currently inside the monitoring window.
  pub fn failure_count(&self) -> usize {
    let mut inner = self.inner.lock().expect("breaker lock poisoned");
    Self::prune(&mut inner.failures, self.config.monitoring_window);
    inner.failures.len()
  }

  /// Run `f` through the breaker. Rejected calls fail with a synthetic
  /// circuit-open error and never invoke `f`.
  pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    match self.admit() {
      Admission::Reject(remaining) => {
        debug!(category = %self.category, "circuit open, call rejected");
        return Err(ApiError::circuit_open(&self.category, remaining));
      }
      Admission::Allow => {}
    }

    match f().await {
      Ok(value) => {
        self.on_success();
        Ok(value)
      }
      Err(err) => {
        self.on_failure();
        Err(err)
      }
    }
  }

  fn admit(&self) -> Admission {
    let mut inner = self.inner.lock().expect("breaker lock poisoned");
    let now = Instant::now();

    match inner.state {
      CircuitState::Closed => Admission::Allow,
      CircuitState::Open => {
        let next = inner.next_attempt_at.unwrap_or(now);
        if now >= next {
          // Recovery window elapsed: this call becomes the probe.
          inner.state = CircuitState::HalfOpen;
          inner.probe_in_flight = true;
          debug!(category = %self.category, "circuit half-open, probing");
          Admission::Allow
        } else {
          Admission::Reject(next - now)
        }
      }
      CircuitState::HalfOpen => {
        if inner.probe_in_flight {
          let remaining = inner
            .next_attempt_at
            .map(|next| next.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
          Admission::Reject(remaining)
        } else {
          inner.probe_in_flight = true;
          Admission::Allow
        }
      }
    }
  }

  fn on_success(&self) {
    let mut inner = self.inner.lock().expect("breaker lock poisoned");
    if inner.state == CircuitState::HalfOpen {
      debug!(category = %self.category, "probe succeeded, circuit closed");
      inner.state = CircuitState::Closed;
      inner.failures.clear();
      inner.next_attempt_at = None;
      inner.probe_in_flight = false;
    }
  }

  fn on_failure(&self) {
    let mut inner = self.inner.lock().expect("breaker lock poisoned");
    let now = Instant::now();

    match inner.state {
      CircuitState::HalfOpen => {
        warn!(
          category = %self.category,
          "probe failed, circuit re-opened for {:?}",
          self.config.recovery_timeout
        );
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(now + self.config.recovery_timeout);
        inner.probe_in_flight = false;
      }
      CircuitState::Closed | CircuitState::Open => {
        inner.failures.push_back(now);
        Self::prune(&mut inner.failures, self.config.monitoring_window);

        if inner.state == CircuitState::Closed
          && inner.failures.len() >= self.config.failure_threshold
        {
          warn!(
            category = %self.category,
            failures = inner.failures.len(),
            "failure threshold reached, circuit opened for {:?}",
            self.config.recovery_timeout
          );
          inner.state = CircuitState::Open;
          inner.next_attempt_at = Some(now + self.config.recovery_timeout);
        }
      }
    }
  }

  fn prune(failures: &mut VecDeque<Instant>, window: Duration) {
    let now = Instant::now();
    while let Some(oldest) = failures.front() {
      if now.duration_since(*oldest) > window {
        failures.pop_front();
      } else {
        break;
      }
    }
  }
}

/// One breaker per remote operation category.
pub struct OperationCircuits {
  pub list: CircuitBreaker,
  pub get: CircuitBreaker,
  pub create: CircuitBreaker,
  pub update: CircuitBreaker,
  pub delete: CircuitBreaker,
}

impl OperationCircuits {
  pub fn new(config: &CircuitBreakerConfig) -> Self {
    Self {
      list: CircuitBreaker::new("entry.list", config.clone()),
      get: CircuitBreaker::new("entry.get", config.clone()),
      create: CircuitBreaker::new("entry.create", config.clone()),
      update: CircuitBreaker::new("entry.update", config.clone()),
      delete: CircuitBreaker::new("entry.delete", config.clone()),
    }
  }
}

impl Default for OperationCircuits {
  fn default() -> Self {
    Self::new(&CircuitBreakerConfig::default())
  }
}
