//! In-process medium, mainly for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::Medium;
use crate::error::MediumError;

/// Volatile medium keeping entries in first-insertion order.
///
/// Writes and reads can be made to fail on demand to exercise error paths.
#[derive(Default)]
pub struct MemoryMedium {
  entries: Mutex<Vec<(String, String)>>,
  fail_writes: AtomicBool,
  fail_reads: AtomicBool,
}

impl MemoryMedium {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make `set`, `remove` and `clear` fail until switched back off.
  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  /// Make `get` and `all_keys` fail until switched back off.
  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  /// Number of stored entries.
  /// Peek at the raw text stored under `key`, bypassing failure injection.
  pub fn raw(&self, key: &str) -> Option<String> {
    let entries = self.entries().ok()?;
    entries
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.clone())
  }

  fn entries(&self) -> Result<MutexGuard<'_, Vec<(String, String)>>, MediumError> {
    self
      .entries
      .lock()
      .map_err(|e| MediumError::Poisoned(e.to_string()))
  }

  fn check(&self, flag: &AtomicBool, op: &str) -> Result<(), MediumError> {
    if flag.load(Ordering::SeqCst) {
      return Err(MediumError::Unavailable(format!("{} rejected", op)));
    }
    Ok(())
  }
}

#[async_trait]
impl Medium for MemoryMedium {
  async fn get(&self, key: &str) -> Result<Option<String>, MediumError> {
    self.check(&self.fail_reads, "get")?;
    let entries = self.entries()?;
    Ok(
      entries
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone()),
    )
  }

  async fn set(&self, key: &str, value: &str) -> Result<(), MediumError> {
    self.check(&self.fail_writes, "set")?;
    let mut entries = self.entries()?;
    match entries.iter_mut().find(|(k, _)| k == key) {
      Some(entry) => entry.1 = value.to_string(),
      None => entries.push((key.to_string(), value.to_string())),
    }
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), MediumError> {
    self.check(&self.fail_writes, "remove")?;
    self.entries()?.retain(|(k, _)| k != key);
    Ok(())
  }

  async fn clear(&self) -> Result<(), MediumError> {
    self.check(&self.fail_writes, "clear")?;
    self.entries()?.clear();
    Ok(())
  }

  async fn all_keys(&self) -> Result<Vec<String>, MediumError> {
    self.check(&self.fail_reads, "all_keys")?;
    Ok(self.entries()?.iter().map(|(k, _)| k.clone()).collect())
  }
}
