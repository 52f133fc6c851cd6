//! Typed errors for the data layer.
//!
//! Raw transport failures are classified exactly once, at the boundary where
//! the remote call's result is received. Everything above that boundary works
//! with [`ApiError`]: a kind, a retryable flag, and a human-readable message.

use std::time::Duration;

/// Failure categories for remote record operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// Transport-level failure (connect, timeout, DNS)
  Network,
  /// Server-side failure (5xx-equivalent)
  Server,
  /// Authentication or permission failure
  Auth,
  /// The server asked us to back off
  RateLimit,
  /// Version conflict: the record changed server-side since we last read it
  Conflict,
  /// Malformed input or content too large
  Validation,
  /// Synthetic error: the circuit breaker rejected the call, no request was made
  CircuitOpen,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Server => "server",
      Self::Auth => "auth",
      Self::RateLimit => "rate-limit",
      Self::Conflict => "conflict",
      Self::Validation => "validation",
      Self::CircuitOpen => "circuit-open",
    }
  }
}

/// A classified remote-operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} error: {message}", .kind.as_str())]
pub struct ApiError {
  pub kind: ErrorKind,
  pub retryable: bool,
  pub message: String,
}

impl ApiError {
  pub fn new(kind: ErrorKind, retryable: bool, message: impl Into<String>) -> Self {
    Self {
      kind,
      retryable,
      message: message.into(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Network, true, message)
  }

  pub fn server(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Server, true, message)
  }

  pub fn auth(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Auth, false, message)
  }

  pub fn rate_limit(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::RateLimit, true, message)
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Conflict, false, message)
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Validation, false, message)
  }

  /// Synthetic rejection emitted by an open circuit breaker.
  /// Carries the remaining wait so callers can report it.
  pub fn circuit_open(category: &str, remaining: Duration) -> Self {
    Self::new(
      ErrorKind::CircuitOpen,
      false,
      format!(
        "circuit open for '{}', retry in {:.1}s",
        category,
        remaining.as_secs_f64()
      ),
    )
  }

  pub fn is_circuit_open(&self) -> bool {
    self.kind == ErrorKind::CircuitOpen
  }

  pub fn is_conflict(&self) -> bool {
    self.kind == ErrorKind::Conflict
  }
}

/// Classify an HTTP status code into the error taxonomy.
///
/// Called once per response at the transport boundary; nothing above it
/// re-interprets status codes.
pub fn classify_status(status: u16, detail: &str) -> ApiError {
  match status {
    401 | 403 => ApiError::auth(format!("request rejected ({}): {}", status, detail)),
    409 | 412 => ApiError::conflict(format!("record changed on the server: {}", detail)),
    413 | 422 => ApiError::validation(format!("request rejected ({}): {}", status, detail)),
    429 => ApiError::rate_limit(format!("rate limited: {}", detail)),
    s if s >= 500 => ApiError::server(format!("server error ({}): {}", s, detail)),
    s => ApiError::new(
      ErrorKind::Validation,
      false,
      format!("unexpected status {}: {}", s, detail),
    ),
  }
}
