//! Backing persistent media.
//!
//! A medium is a plain async key/text store. It knows nothing about records,
//! expiry or obfuscation; the durable store layers those on top.

mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::error::MediumError;

pub use memory::MemoryMedium;
pub use sqlite::SqliteMedium;

/// Trait for backing persistent media.
#[async_trait]
pub trait Medium: Send + Sync {
  /// Fetch the text stored under `key`.
  async fn get(&self, key: &str) -> Result<Option<String>, MediumError>;

  /// Store `value` under `key`, replacing any previous value.
  async fn set(&self, key: &str, value: &str) -> Result<(), MediumError>;

  /// Delete `key`. Deleting an absent key is not an error.
  async fn remove(&self, key: &str) -> Result<(), MediumError>;

  /// Delete every key.
  async fn clear(&self) -> Result<(), MediumError>;

  /// Enumerate all keys in a stable order.
  async fn all_keys(&self) -> Result<Vec<String>, MediumError>;
}
