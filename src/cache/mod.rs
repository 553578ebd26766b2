//! Response cache with TTL expiry and a bounded entry count.
//!
//! This module provides:
//! - Entries keyed by request identity (`METHOD:url` by default)
//! - Lazy purge of expired entries on read, eager purge during eviction
//! - Oldest-first eviction once the entry ceiling is exceeded
//! - Absorbed storage failures (a broken cache never fails a request)

mod entry;
mod layer;

pub use entry::CacheEntry;
pub use layer::{CacheConfig, ResponseCache, CACHE_PREFIX};

use crate::request::Method;

/// Default cache key for a request: `METHOD:url`.
pub fn cache_key(method: Method, url: &str) -> String {
  format!("{}:{}", method, url)
}
