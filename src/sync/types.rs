//! Queue entries, connectivity and drain configuration.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default time between periodic drain attempts.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of passes per drain.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Kind of mutation recorded in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Set,
  Remove,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Operation::Set => write!(f, "set"),
      Operation::Remove => write!(f, "remove"),
    }
  }
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
  pub key: String,
  /// New value; `null` for removals
  pub value: Value,
  pub operation: Operation,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
  /// Record that `key` was set to `value`.
  pub fn set<T: Serialize + ?Sized>(key: impl Into<String>, value: &T) -> Result<Self> {
    Ok(Self {
      key: key.into(),
      value: serde_json::to_value(value).map_err(Error::Json)?,
      operation: Operation::Set,
      enqueued_at: Utc::now().trunc_subsecs(3),
    })
  }

  /// Record that `key` was removed.
  pub fn remove(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      value: Value::Null,
      operation: Operation::Remove,
      enqueued_at: Utc::now().trunc_subsecs(3),
    }
  }
}

/// Connectivity as last reported by the observer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityState {
  pub is_connected: bool,
  pub last_sync_at: Option<DateTime<Utc>>,
}

/// Whether a drain is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainState {
  #[default]
  Idle,
  Draining,
}

/// What a call to `drain` did.
#[derive(Debug)]
pub enum DrainOutcome {
  /// Nothing was queued
  Empty,
  /// Every drained entry was applied
  Synced { applied: usize, attempts: u32 },
  /// Every pass failed; the queue is untouched
  Failed { attempts: u32, error: Error },
}

impl DrainOutcome {
  pub fn is_synced(&self) -> bool {
    matches!(self, DrainOutcome::Synced { .. })
  }
}

pub type CompleteCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Drain scheduling and notification options.
#[derive(Clone)]
pub struct SyncOptions {
  /// Time between periodic drain attempts
  pub interval: Duration,
  /// Passes per drain before giving up; zero behaves as one
  pub max_retries: u32,
  /// Called with `true` after a successful drain
  pub on_complete: Option<CompleteCallback>,
  /// Called with the last error once every pass of a drain failed
  pub on_error: Option<ErrorCallback>,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      interval: DEFAULT_SYNC_INTERVAL,
      max_retries: DEFAULT_MAX_RETRIES,
      on_complete: None,
      on_error: None,
    }
  }
}

impl SyncOptions {
  pub fn interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn on_complete(mut self, callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
    self.on_complete = Some(Arc::new(callback));
    self
  }

  pub fn on_error(mut self, callback: impl Fn(&Error) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(callback));
    self
  }
}

impl fmt::Debug for SyncOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SyncOptions")
      .field("interval", &self.interval)
      .field("max_retries", &self.max_retries)
      .field("on_complete", &self.on_complete.is_some())
      .field("on_error", &self.on_error.is_some())
      .finish()
  }
}
