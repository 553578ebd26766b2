//! YAML configuration for the client and the `rfetch` binary.

use chrono::Duration as ChronoDuration;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::queue::QueueConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
  /// Base URL relative request paths are resolved against
  pub base_url: Option<String>,
  /// Timeout for each network attempt
  pub request_timeout_secs: u64,
  /// SQLite store location (defaults to the user data directory)
  pub storage_path: Option<PathBuf>,
  pub cache: CacheSection,
  pub queue: QueueSection,
  pub retry: RetrySection,
  /// Reachability probe. Without one the client assumes it is online.
  pub probe: Option<ProbeSection>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      base_url: None,
      request_timeout_secs: 15,
      storage_path: None,
      cache: CacheSection::default(),
      queue: QueueSection::default(),
      retry: RetrySection::default(),
      probe: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSection {
  pub max_entries: usize,
  pub default_ttl_secs: u64,
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      max_entries: 100,
      default_ttl_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSection {
  pub capacity: usize,
  pub max_attempts: u32,
}

impl Default for QueueSection {
  fn default() -> Self {
    Self {
      capacity: 50,
      max_attempts: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySection {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetrySection {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeSection {
  pub host: String,
  #[serde(default = "default_probe_port")]
  pub port: u16,
  #[serde(default = "default_probe_interval")]
  pub interval_secs: u64,
}

fn default_probe_port() -> u16 {
  443
}

fn default_probe_interval() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./rfetch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/resilient-fetch/config.yaml
  ///
  /// Falls back to defaults when no file is found. `RFETCH_BASE_URL`
  /// overrides `base_url`.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(base_url) = std::env::var("RFETCH_BASE_URL") {
      config.base_url = Some(base_url);
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rfetch.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("resilient-fetch").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs.max(1))
  }

  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig {
      max_entries: self.cache.max_entries,
      default_ttl: ttl_from_secs(self.cache.default_ttl_secs),
    }
  }

  pub fn queue_config(&self) -> QueueConfig {
    QueueConfig {
      capacity: self.queue.capacity,
      default_max_attempts: self.queue.max_attempts,
      attempt_timeout: self.request_timeout(),
    }
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.retry.max_attempts,
      base_delay: Duration::from_millis(self.retry.base_delay_ms),
      max_delay: Duration::from_millis(self.retry.max_delay_ms),
    }
  }
}

/// Convert a TTL in seconds, saturating at the largest representable duration.
pub fn ttl_from_secs(secs: u64) -> ChronoDuration {
  i64::try_from(secs)
    .ok()
    .and_then(ChronoDuration::try_seconds)
    .unwrap_or(ChronoDuration::MAX)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_yaml_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.cache.max_entries, 100);
    assert_eq!(config.queue.capacity, 50);
    assert_eq!(config.queue.max_attempts, 3);
    assert_eq!(config.retry_policy(), RetryPolicy::default());
    assert_eq!(config.request_timeout(), Duration::from_secs(15));
    assert!(config.probe.is_none());
  }

  #[test]
  fn test_partial_yaml() {
    let config = Config::from_yaml(
      r#"
base_url: https://api.example.com/
cache:
  max_entries: 10
queue:
  capacity: 5
probe:
  host: example.com
"#,
    )
    .unwrap();

    assert_eq!(config.base_url.as_deref(), Some("https://api.example.com/"));
    assert_eq!(config.cache.max_entries, 10);
    assert_eq!(config.cache.default_ttl_secs, 300);
    assert_eq!(config.queue_config().capacity, 5);
    let probe = config.probe.unwrap();
    assert_eq!(probe.port, 443);
    assert_eq!(probe.interval_secs, 30);
  }

  #[test]
  fn test_ttl_from_secs_saturates() {
    assert_eq!(ttl_from_secs(300), ChronoDuration::minutes(5));
    assert_eq!(ttl_from_secs(u64::MAX), ChronoDuration::MAX);

    let config = Config::from_yaml("cache:\n  default_ttl_secs: 18446744073709551615\n").unwrap();
    assert_eq!(config.cache_config().default_ttl, ChronoDuration::MAX);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rfetch.yaml");
    std::fs::write(&path, "request_timeout_secs: 5\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.request_timeout(), Duration::from_secs(5));
  }
}
