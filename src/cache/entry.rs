//! Stored form of a cached response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached payload and its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  /// Logical cache key (e.g. "GET:/users/42")
  pub key: String,
  pub payload: T,
  /// When the entry was written. Eviction order is oldest first.
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  /// An entry is valid strictly before its expiry instant.
  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    now < self.expires_at
  }
}

/// Entry timestamps without the payload, for eviction scans.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EntryMeta {
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}
