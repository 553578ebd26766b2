//! String-keyed persistence backend shared by the cache and the queue.
//!
//! Each consumer owns its own key namespace:
//! - `cache:<sha256>` for response cache entries
//! - `queue:pending` for the serialized mutation queue

mod sqlite;

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub use sqlite::SqliteStore;

/// Trait for persistence backends.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace the value at `key`.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove `key`. Returns whether it existed.
  fn remove(&self, key: &str) -> Result<bool>;

  /// All keys starting with `prefix`, in ascending order.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
  fail_reads: AtomicBool,
  fail_writes: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every read return an error (for exercising failure paths).
  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  /// Make every write return an error (for exercising failure paths).
  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  fn check_read(&self) -> Result<()> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(eyre!("Simulated read failure"));
    }
    Ok(())
  }

  fn check_write(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("Simulated write failure"));
    }
    Ok(())
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    self.check_read()?;
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.check_write()?;
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    self.check_write()?;
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.remove(key).is_some())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    self.check_read()?;
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}
