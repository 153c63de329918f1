use thiserror::Error;

/// Failure reported by a backing persistent medium.
#[derive(Error, Debug)]
pub enum MediumError {
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("Lock poisoned: {0}")]
  Poisoned(String),

  #[error("Medium unavailable: {0}")]
  Unavailable(String),
}

/// Error produced by an external sink while applying a queued entry.
pub type SinkError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("Secret key must be at least {min} characters long")]
  InvalidKey { min: usize },

  #[error("Codec not initialized - call initialize(secret) first")]
  NotInitialized,

  #[error("Failed to decode obfuscated value: {0}")]
  DecodeFailure(String),

  #[error("Invalid JSON value: {0}")]
  Json(#[from] serde_json::Error),

  #[error("Failed to store '{key}'")]
  PersistFailure {
    key: String,
    #[source]
    source: MediumError,
  },

  #[error("Failed to remove '{key}'")]
  RemoveFailure {
    key: String,
    #[source]
    source: MediumError,
  },

  #[error("Failed to clear storage")]
  ClearFailure(#[source] MediumError),

  #[error("Sink rejected '{key}': {source}")]
  SinkFailure {
    key: String,
    #[source]
    source: SinkError,
  },
}

pub type Result<T> = std::result::Result<T, Error>;
