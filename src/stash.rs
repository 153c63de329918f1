//! Keyed values written through the cache, the store and the replay queue.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::BoundedCache;
use crate::error::Result;
use crate::medium::Medium;
use crate::store::DurableStore;
use crate::sync::{QueueEntry, ReplayQueue, Sink};

/// Per-call routing for [`Stash`] operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
  /// Store the value through the obfuscation codec
  pub obfuscate: bool,
  /// Also go through the bounded cache, which may evict another entry
  pub cache: bool,
  /// Record the mutation in the replay queue
  pub sync: bool,
  /// Expiry of the stored record; `None` keeps it forever
  pub expiry: Option<Duration>,
}

impl WriteOptions {
  pub fn obfuscate(mut self, obfuscate: bool) -> Self {
    self.obfuscate = obfuscate;
    self
  }

  pub fn cache(mut self, cache: bool) -> Self {
    self.cache = cache;
    self
  }

  pub fn sync(mut self, sync: bool) -> Self {
    self.sync = sync;
    self
  }

  pub fn expiry(mut self, expiry: Duration) -> Self {
    self.expiry = Some(expiry);
    self
  }
}

/// The store, cache and queue wired over one medium.
pub struct Stash<M: Medium, S: Sink> {
  store: Arc<DurableStore<M>>,
  cache: BoundedCache<M>,
  queue: ReplayQueue<M, S>,
}

impl<M: Medium + 'static, S: Sink + 'static> Stash<M, S> {
  /// `cache` and `queue` must sit on the same store.
  pub fn new(cache: BoundedCache<M>, queue: ReplayQueue<M, S>) -> Self {
    Self {
      store: Arc::clone(cache.store()),
      cache,
      queue,
    }
  }

  pub fn store(&self) -> &Arc<DurableStore<M>> {
    &self.store
  }

  pub fn cache(&self) -> &BoundedCache<M> {
    &self.cache
  }

  pub fn queue(&self) -> &ReplayQueue<M, S> {
    &self.queue
  }

  /// Write `value` under `key`.
  ///
  /// The store write always happens and decides the record that is kept; the
  /// cache write before it only enforces the entry limit.
  pub async fn write<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    options: WriteOptions,
  ) -> Result<()> {
    if options.cache {
      self.cache.set(key, value, options.expiry).await?;
    }

    self
      .store
      .set(key, value, options.obfuscate, options.expiry)
      .await?;

    if options.sync {
      self.queue.enqueue(QueueEntry::set(key, value)?).await?;
    }
    Ok(())
  }

  /// Delete `key`, queueing a removal when `options.sync` is set.
  pub async fn delete(&self, key: &str, options: WriteOptions) -> Result<()> {
    if options.cache {
      self.cache.remove(key).await?;
    }

    self.store.remove(key).await?;

    if options.sync {
      self.queue.enqueue(QueueEntry::remove(key)).await?;
    }
    Ok(())
  }

  /// Read `key`, trying the cache first when `options.cache` is set.
  pub async fn read<T: DeserializeOwned>(&self, key: &str, options: WriteOptions) -> Result<Option<T>> {
    if options.cache {
      match self.cache.get(key).await {
        Ok(Some(value)) => {
          debug!(key, "cache hit");
          return Ok(Some(value));
        }
        Ok(None) => {}
        // Written with different obfuscation than the cache is configured for.
        Err(e) => warn!(key, error = %e, "cache read failed, falling back to store"),
      }
    }

    self.store.get(key, options.obfuscate).await
  }
}
