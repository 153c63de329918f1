//! SQLite-backed medium.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::Medium;
use crate::error::MediumError;

/// Schema for the key/value table.
const MEDIUM_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite-based medium. Keys enumerate in first-insertion order.
pub struct SqliteMedium {
  conn: Mutex<Connection>,
}

impl SqliteMedium {
  /// Open (or create) a database at `path`.
  pub fn open(path: &Path) -> Result<Self, MediumError> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent).map_err(|e| {
          MediumError::Unavailable(format!(
            "Failed to create database directory {}: {}",
            parent.display(),
            e
          ))
        })?;
      }
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened sqlite medium");
    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn in_memory() -> Result<Self, MediumError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, MediumError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| MediumError::Unavailable("Could not determine data directory".into()))?;

    Ok(data_dir.join("stashkit").join("store.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self, MediumError> {
    conn.execute_batch(MEDIUM_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, MediumError> {
    self
      .conn
      .lock()
      .map_err(|e| MediumError::Poisoned(e.to_string()))
  }
}

#[async_trait]
impl Medium for SqliteMedium {
  async fn get(&self, key: &str) -> Result<Option<String>, MediumError> {
    let conn = self.lock()?;
    let value = conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    Ok(value)
  }

  async fn set(&self, key: &str, value: &str) -> Result<(), MediumError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO kv (key, value) VALUES (?1, ?2)
       ON CONFLICT(key) DO UPDATE SET value = excluded.value",
      params![key, value],
    )?;
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), MediumError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
    Ok(())
  }

  async fn clear(&self) -> Result<(), MediumError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv", [])?;
    Ok(())
  }

  async fn all_keys(&self) -> Result<Vec<String>, MediumError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY rowid")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }
}
