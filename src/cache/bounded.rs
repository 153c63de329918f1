//! Size-bounded cache over the durable store.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use super::config::{CacheConfig, CacheConfigUpdate};
use crate::error::Result;
use crate::medium::Medium;
use crate::store::{DurableStore, RESERVED_PREFIX};

/// Cache enforcing a maximum entry count and a default expiry.
///
/// Writing a new key while the store already holds `max_entries` keys evicts
/// exactly one entry, the one written longest ago. Bursts can therefore leave
/// the store above the limit; it never shrinks back on its own.
pub struct BoundedCache<M: Medium> {
  store: Arc<DurableStore<M>>,
  config: RwLock<CacheConfig>,
}

impl<M: Medium> BoundedCache<M> {
  pub fn new(store: Arc<DurableStore<M>>, config: CacheConfig) -> Self {
    Self {
      store,
      config: RwLock::new(config),
    }
  }

  pub fn store(&self) -> &Arc<DurableStore<M>> {
    &self.store
  }

  /// Snapshot of the live configuration.
  pub fn configuration(&self) -> CacheConfig {
    *self.config.read().unwrap_or_else(|e| e.into_inner())
  }

  /// Merge `update` into the live configuration. Existing entries keep the
  /// expiry and obfuscation they were written with.
  pub fn update_configuration(&self, update: CacheConfigUpdate) {
    let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
    *config = config.merge(update);
    debug!(?config, "cache configuration updated");
  }

  /// Write `value`, evicting the oldest entry first if the cache is full.
  pub async fn set<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    custom_expiry: Option<Duration>,
  ) -> Result<()> {
    let config = self.configuration();
    let keys = self.store.all_keys().await;

    if keys.len() >= config.max_entries && !self.store.has_key(key).await {
      if let Some(oldest) = self.find_oldest(&keys).await {
        debug!(evicted = %oldest, size = keys.len(), "cache full, evicting oldest entry");
        self.store.remove(&oldest).await?;
      }
    }

    let expiry = custom_expiry.unwrap_or_else(|| config.expiry());
    self
      .store
      .set(key, value, config.obfuscate, Some(expiry))
      .await
  }

  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let obfuscate = self.configuration().obfuscate;
    self.store.get(key, obfuscate).await
  }

  pub async fn remove(&self, key: &str) -> Result<()> {
    self.store.remove(key).await
  }

  pub async fn clear(&self) -> Result<()> {
    self.store.clear().await
  }

  /// Number of keys the store knows of, including expired ones not yet read.
  pub async fn size(&self) -> usize {
    self.store.all_keys().await.len()
  }

  /// Existence check; ignores expiry.
  pub async fn has(&self, key: &str) -> bool {
    self.store.has_key(key).await
  }

  /// Key with the smallest `writtenAt`; ties go to the first enumerated.
  async fn find_oldest(&self, keys: &[String]) -> Option<String> {
    let mut oldest: Option<(&String, chrono::DateTime<chrono::Utc>)> = None;

    for key in keys.iter().filter(|k| !k.starts_with(RESERVED_PREFIX)) {
      let Some(record) = self.store.record(key).await else {
        continue;
      };
      match oldest {
        Some((_, written_at)) if written_at <= record.written_at => {}
        _ => oldest = Some((key, record.written_at)),
      }
    }

    oldest.map(|(key, _)| key.clone())
  }
}
