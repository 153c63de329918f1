//! Durable key-value store.
//!
//! Records are written through an in-process map to the backing medium. The
//! medium is the source of truth; the map only accelerates reads and may lag
//! behind it after a failed write.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::codec::Obfuscator;
use crate::error::{Error, Result};
use crate::medium::Medium;

/// Keys starting with this prefix belong to the library itself.
pub const RESERVED_PREFIX: &str = "__";

/// One durable entry, persisted as `{value, writtenAt, expiryMs?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
  /// Payload, or its obfuscated text form
  pub value: Value,
  /// When the record was written
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub written_at: DateTime<Utc>,
  /// Lifetime in milliseconds; `None` never expires
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expiry_ms: Option<u64>,
}

impl StoredRecord {
  /// Whether the record is logically absent at `now`.
  ///
  /// A zero lifetime is expired from the moment it is written.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    match self.expiry_ms {
      None => false,
      Some(0) => true,
      // Lifetimes beyond i64::MAX milliseconds never run out.
      Some(ms) => {
        i64::try_from(ms).is_ok_and(|ms| (now - self.written_at).num_milliseconds() > ms)
      }
    }
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }
}

/// Key-value store over a backing medium.
pub struct DurableStore<M: Medium> {
  medium: Arc<M>,
  codec: Arc<Obfuscator>,
  memory: Mutex<HashMap<String, StoredRecord>>,
  /// Serializes every mutation, in arrival order
  write_gate: tokio::sync::Mutex<()>,
}

impl<M: Medium> DurableStore<M> {
  /// Create a store over `medium`, obfuscating through `codec` on request.
  pub fn new(medium: M, codec: Arc<Obfuscator>) -> Self {
    Self {
      medium: Arc::new(medium),
      codec,
      memory: Mutex::new(HashMap::new()),
      write_gate: tokio::sync::Mutex::new(()),
    }
  }

  pub fn medium(&self) -> &M {
    &self.medium
  }

  pub fn codec(&self) -> &Arc<Obfuscator> {
    &self.codec
  }

  /// Write `value` under `key`.
  ///
  /// The in-process map is updated even when the medium write fails, so a
  /// following `get` may still see the value until the next reload.
  pub async fn set<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    obfuscate: bool,
    expiry: Option<Duration>,
  ) -> Result<()> {
    let value = if obfuscate {
      Value::String(self.codec.encode(value)?)
    } else {
      serde_json::to_value(value)?
    };

    let _gate = self.write_gate.lock().await;

    // Millisecond precision, matching what the medium keeps.
    let now = Utc::now().trunc_subsecs(3);
    let previous = self.memory().get(key).map(|r| r.written_at);
    let written_at = match previous {
      Some(previous) if previous > now => previous,
      _ => now,
    };
    let record = StoredRecord {
      value,
      written_at,
      expiry_ms: expiry.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
    };
    let text = serde_json::to_string(&record)?;

    self.memory().insert(key.to_string(), record);

    if let Err(source) = self.medium.set(key, &text).await {
      error!(key, error = %source, "failed to persist record");
      return Err(Error::PersistFailure {
        key: key.to_string(),
        source,
      });
    }
    Ok(())
  }

  /// Read the value under `key`.
  ///
  /// Returns `None` when the key is absent, expired, or the medium could not
  /// be read. Reading an expired record removes it.
  pub async fn get<T: DeserializeOwned>(&self, key: &str, obfuscate: bool) -> Result<Option<T>> {
    let record = match self.record(key).await {
      Some(record) => record,
      None => return Ok(None),
    };

    if record.is_expired() {
      self.expire(key, &record).await;
      return Ok(None);
    }

    self.decode_value(record.value, obfuscate).map(Some)
  }

  /// Raw record lookup, read-through, without evaluating expiry.
  pub async fn record(&self, key: &str) -> Option<StoredRecord> {
    let cached = self.memory().get(key).cloned();
    if let Some(record) = cached {
      debug!(key, "memory hit");
      return Some(record);
    }

    let text = match self.medium.get(key).await {
      Ok(Some(text)) => text,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "failed to read record");
        return None;
      }
    };

    let record: StoredRecord = match serde_json::from_str(&text) {
      Ok(record) => record,
      Err(e) => {
        warn!(key, error = %e, "unreadable record");
        return None;
      }
    };

    self.memory().insert(key.to_string(), record.clone());
    Some(record)
  }

  /// Delete `key` from memory and the medium. Absent keys are fine.
  pub async fn remove(&self, key: &str) -> Result<()> {
    let _gate = self.write_gate.lock().await;
    self.remove_unguarded(key).await
  }

  /// Delete everything.
  pub async fn clear(&self) -> Result<()> {
    let _gate = self.write_gate.lock().await;

    self.memory().clear();
    self.medium.clear().await.map_err(|source| {
      error!(error = %source, "failed to clear storage");
      Error::ClearFailure(source)
    })
  }

  /// Keys known to the medium. Enumeration failures yield an empty list.
  pub async fn all_keys(&self) -> Vec<String> {
    match self.medium.all_keys().await {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "failed to list keys");
        Vec::new()
      }
    }
  }

  /// Whether the medium holds `key`, expired or not.
  pub async fn has_key(&self, key: &str) -> bool {
    match self.medium.get(key).await {
      Ok(value) => value.is_some(),
      Err(e) => {
        warn!(key, error = %e, "failed to check key");
        false
      }
    }
  }

  /// Remove `key` if it still holds the expired record `seen`.
  async fn expire(&self, key: &str, seen: &StoredRecord) {
    let _gate = self.write_gate.lock().await;

    // A writer may have replaced the record while we waited for the gate.
    match self.record(key).await {
      Some(current) if current.written_at == seen.written_at && current.is_expired() => {}
      _ => return,
    }

    debug!(key, "removing expired record");
    if let Err(e) = self.remove_unguarded(key).await {
      warn!(key, error = %e, "failed to remove expired record");
    }
  }

  async fn remove_unguarded(&self, key: &str) -> Result<()> {
    self.memory().remove(key);
    self.medium.remove(key).await.map_err(|source| {
      error!(key, error = %source, "failed to remove record");
      Error::RemoveFailure {
        key: key.to_string(),
        source,
      }
    })
  }

  fn decode_value<T: DeserializeOwned>(&self, value: Value, obfuscate: bool) -> Result<T> {
    if !obfuscate {
      return Ok(serde_json::from_value(value)?);
    }

    match value {
      Value::String(text) => self.codec.decode(&text),
      other => Err(Error::DecodeFailure(format!(
        "expected obfuscated text, found {}",
        json_kind(&other)
      ))),
    }
  }

  fn memory(&self) -> MutexGuard<'_, HashMap<String, StoredRecord>> {
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn json_kind(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}
