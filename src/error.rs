//! Error taxonomy for network calls.

use serde::{Deserialize, Serialize};

/// Failure of a single network call.
///
/// Closed set: callers and the retry machinery branch on the variant, never on
/// message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchError {
  /// No reachable network.
  #[error("no network connection")]
  Connectivity,

  /// The request did not complete in time.
  #[error("request timed out")]
  Timeout,

  /// The server asked us to slow down (429).
  #[error("rate limited by server")]
  RateLimited,

  /// 5xx-class response.
  #[error("server unavailable (HTTP {status})")]
  ServerUnavailable { status: u16 },

  /// Non-retryable 4xx response.
  #[error("request rejected (HTTP {status}): {message}")]
  Validation { status: u16, message: String },

  #[error("resource not found")]
  NotFound,

  #[error("conflict with current resource state")]
  Conflict,

  #[error("unexpected failure: {0}")]
  Unknown(String),
}

impl FetchError {
  /// Whether a later attempt may succeed.
  pub fn is_retryable(&self) -> bool {
    match self {
      FetchError::Connectivity
      | FetchError::Timeout
      | FetchError::RateLimited
      | FetchError::ServerUnavailable { .. } => true,
      FetchError::Validation { .. }
      | FetchError::NotFound
      | FetchError::Conflict
      | FetchError::Unknown(_) => false,
    }
  }

  /// Classify a non-success HTTP status.
  pub fn from_status(status: u16, body: &str) -> Self {
    match status {
      408 => FetchError::Timeout,
      429 => FetchError::RateLimited,
      404 => FetchError::NotFound,
      409 => FetchError::Conflict,
      500..=599 => FetchError::ServerUnavailable { status },
      400..=499 => FetchError::Validation {
        status,
        message: body.chars().take(200).collect(),
      },
      _ => FetchError::Unknown(format!("unexpected HTTP status {}", status)),
    }
  }
}
