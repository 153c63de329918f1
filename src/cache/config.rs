//! Cache configuration and partial updates.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lifetime of a cached entry (1 hour).
pub const DEFAULT_EXPIRY_MS: u64 = 60 * 60 * 1000;

/// Default maximum number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Live cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Lifetime applied when a write does not supply its own
  pub expiry_ms: u64,
  /// Entry count at which writes of new keys evict the oldest entry
  pub max_entries: usize,
  /// Whether values are obfuscated at rest
  pub obfuscate: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      expiry_ms: DEFAULT_EXPIRY_MS,
      max_entries: DEFAULT_MAX_ENTRIES,
      obfuscate: false,
    }
  }
}

impl CacheConfig {
  pub fn expiry(&self) -> Duration {
    Duration::from_millis(self.expiry_ms)
  }

  /// Overlay the fields set in `update`.
  pub fn merge(self, update: CacheConfigUpdate) -> Self {
    Self {
      expiry_ms: update.expiry_ms.unwrap_or(self.expiry_ms),
      max_entries: update.max_entries.unwrap_or(self.max_entries),
      obfuscate: update.obfuscate.unwrap_or(self.obfuscate),
    }
  }
}

/// Partial configuration; unset fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CacheConfigUpdate {
  pub expiry_ms: Option<u64>,
  pub max_entries: Option<usize>,
  pub obfuscate: Option<bool>,
}

impl CacheConfigUpdate {
  pub fn expiry_ms(mut self, expiry_ms: u64) -> Self {
    self.expiry_ms = Some(expiry_ms);
    self
  }

  pub fn max_entries(mut self, max_entries: usize) -> Self {
    self.max_entries = Some(max_entries);
    self
  }

  pub fn obfuscate(mut self, obfuscate: bool) -> Self {
    self.obfuscate = Some(obfuscate);
    self
  }
}
