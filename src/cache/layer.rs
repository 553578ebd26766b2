//! TTL response cache over a [`KeyValueStore`].

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryMeta};
use crate::clock::Clock;
use crate::store::KeyValueStore;

/// Storage namespace for cache entries.
pub const CACHE_PREFIX: &str = "cache:";

/// Cache sizing and lifetime.
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Ceiling on stored entries
  pub max_entries: usize,
  /// TTL applied when the caller does not pick one
  pub default_ttl: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_entries: 100,
      default_ttl: Duration::minutes(5),
    }
  }
}

/// Longest lifetime an entry can get; larger TTLs are clamped.
fn max_ttl() -> Duration {
  Duration::days(36_500)
}

/// Short-lived response cache.
///
/// The cache is an optimization, never a source of truth: storage failures on
/// read are misses and failures on write are logged and dropped.
pub struct ResponseCache {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  config: CacheConfig,
  /// Serializes get/set/evict so a set is visible to the next get on its key
  lock: Mutex<()>,
}

impl ResponseCache {
  pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
    Self {
      store,
      clock,
      config,
      lock: Mutex::new(()),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  fn guard(&self) -> MutexGuard<'_, ()> {
    self.lock.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Look up `key`. Expired entries are purged and reported as absent.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let _guard = self.guard();
    let storage_key = storage_key(key);

    let raw = match self.store.get(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => {
        debug!(key, "cache miss");
        return None;
      }
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    let entry: CacheEntry<serde_json::Value> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "corrupt cache entry, purging");
        self.remove_quietly(&storage_key);
        return None;
      }
    };

    if !entry.is_valid_at(self.clock.now()) {
      debug!(key, "cache entry expired");
      self.remove_quietly(&storage_key);
      return None;
    }

    match serde_json::from_value(entry.payload) {
      Ok(payload) => {
        debug!(key, "cache hit");
        Some(payload)
      }
      Err(e) => {
        warn!(key, error = %e, "cached payload has unexpected shape");
        None
      }
    }
  }

  /// Insert or replace `key` with a lifetime of `ttl`, then enforce the ceiling.
  pub fn set<T: Serialize>(&self, key: &str, payload: &T, ttl: Duration) {
    let _guard = self.guard();
    let now = self.clock.now();

    let payload = match serde_json::to_value(payload) {
      Ok(value) => value,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize cache payload");
        return;
      }
    };

    let entry = CacheEntry {
      key: key.to_string(),
      payload,
      stored_at: now,
      expires_at: now
        .checked_add_signed(ttl.min(max_ttl()))
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
    };

    let storage_key = storage_key(key);
    let write = serde_json::to_string(&entry)
      .map_err(|e| e.to_string())
      .and_then(|raw| {
        self
          .store
          .set(&storage_key, &raw)
          .map_err(|e| e.to_string())
      });
    if let Err(error) = write {
      warn!(key, %error, "cache write failed");
      return;
    }

    self.evict(now, &storage_key);
  }

  /// Insert using the configured default TTL.
  pub fn set_default<T: Serialize>(&self, key: &str, payload: &T) {
    self.set(key, payload, self.config.default_ttl);
  }

  /// Remove `key` if present.
  pub fn invalidate(&self, key: &str) {
    let _guard = self.guard();
    self.remove_quietly(&storage_key(key));
  }

  /// Remove every entry. Returns how many were removed.
  pub fn clear(&self) -> usize {
    let _guard = self.guard();
    let keys = match self.store.keys_with_prefix(CACHE_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "failed to list cache entries");
        return 0;
      }
    };

    let removed = keys
      .iter()
      .filter(|k| matches!(self.store.remove(k), Ok(true)))
      .count();
    debug!(removed, "cache cleared");
    removed
  }

  /// Remove every expired entry now. Returns how many were removed.
  pub fn purge_expired(&self) -> usize {
    let _guard = self.guard();
    let now = self.clock.now();
    let mut removed = 0;
    for (storage_key, meta) in self.scan() {
      let expired = meta.map(|m| m.expires_at <= now).unwrap_or(true);
      if expired && self.remove_quietly(&storage_key) {
        removed += 1;
      }
    }
    removed
  }

  /// Number of stored entries, expired or not.
  pub fn len(&self) -> usize {
    self
      .store
      .keys_with_prefix(CACHE_PREFIX)
      .map(|keys| keys.len())
      .unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Bring the entry count back under the ceiling.
  ///
  /// Expired entries always go first, even when under the ceiling; then the
  /// oldest `stored_at` until the ceiling holds. `just_written` is evicted last.
  fn evict(&self, now: DateTime<Utc>, just_written: &str) {
    let entries = self.scan();
    let all_live = entries
      .iter()
      .all(|(_, m)| m.as_ref().is_some_and(|m| m.expires_at > now));
    if all_live && entries.len() <= self.config.max_entries {
      return;
    }

    let mut live: Vec<(String, DateTime<Utc>)> = Vec::with_capacity(entries.len());
    let mut expired = 0;
    for (storage_key, meta) in entries {
      match meta {
        Some(meta) if meta.expires_at > now => live.push((storage_key, meta.stored_at)),
        _ => {
          if self.remove_quietly(&storage_key) {
            expired += 1;
          }
        }
      }
    }

    let mut evicted = 0;
    if live.len() > self.config.max_entries {
      live.sort_by(|(ka, ta), (kb, tb)| {
        (ka == just_written, ta, ka).cmp(&(kb == just_written, tb, kb))
      });
      let excess = live.len() - self.config.max_entries;
      for (storage_key, _) in live.iter().take(excess) {
        if self.remove_quietly(storage_key) {
          evicted += 1;
        }
      }
    }

    if expired > 0 || evicted > 0 {
      debug!(expired, evicted, "cache eviction pass");
    }
  }

  /// Every stored entry with its timestamps (None if undecodable).
  fn scan(&self) -> Vec<(String, Option<EntryMeta>)> {
    let keys = match self.store.keys_with_prefix(CACHE_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "failed to list cache entries");
        return Vec::new();
      }
    };

    keys
      .into_iter()
      .map(|storage_key| {
        let meta = self
          .store
          .get(&storage_key)
          .ok()
          .flatten()
          .and_then(|raw| serde_json::from_str::<EntryMeta>(&raw).ok());
        (storage_key, meta)
      })
      .collect()
  }

  fn remove_quietly(&self, storage_key: &str) -> bool {
    match self.store.remove(storage_key) {
      Ok(removed) => removed,
      Err(e) => {
        warn!(storage_key, error = %e, "failed to remove cache entry");
        false
      }
    }
  }
}

/// Fixed-length storage key for a logical cache key.
fn storage_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  format!("{}{}", CACHE_PREFIX, hex::encode(hasher.finalize()))
}
