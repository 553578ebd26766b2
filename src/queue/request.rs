//! Queued write operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::request::RequestSpec;

/// A write waiting for delivery.
///
/// Only the queue's drain routine changes `attempts`, `last_attempt_at` and
/// `last_error`; while the item is queued `attempts <= max_attempts` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
  pub id: String,
  pub target: RequestSpec,
  pub enqueued_at: DateTime<Utc>,
  /// Delivery attempts made so far
  pub attempts: u32,
  pub max_attempts: u32,
  /// Human-readable label for diagnostics
  pub context: String,
  #[serde(default)]
  pub last_attempt_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub last_error: Option<FetchError>,
}

impl QueuedRequest {
  pub fn new(target: RequestSpec, max_attempts: u32, context: String, now: DateTime<Utc>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      target,
      enqueued_at: now,
      attempts: 0,
      max_attempts: max_attempts.max(1),
      context,
      last_attempt_at: None,
      last_error: None,
    }
  }

  /// No attempts left.
  pub fn is_exhausted(&self) -> bool {
    self.attempts >= self.max_attempts
  }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Items a delivery attempt was made for
  pub attempted: usize,
  pub delivered: usize,
  /// Items dropped after a permanent error or their last attempt
  pub failed: usize,
  /// Items still queued after the pass
  pub remaining: usize,
  /// Connectivity dropped before every item was tried
  pub interrupted: bool,
  /// The pass did not run (already draining, or offline)
  pub skipped: bool,
}

impl DrainReport {
  pub(crate) fn skipped(remaining: usize) -> Self {
    Self {
      remaining,
      skipped: true,
      ..Self::default()
    }
  }
}
