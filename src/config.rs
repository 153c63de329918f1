use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stashkit::sync::{DEFAULT_MAX_RETRIES, DEFAULT_SYNC_INTERVAL};
use stashkit::{CacheConfig, SqliteMedium, SyncOptions};

/// Environment variable holding the obfuscation secret.
pub const SECRET_ENV: &str = "STASHKIT_SECRET";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// SQLite database file (defaults to <data_dir>/stashkit/store.db)
  pub database: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  /// Directory for daily log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_ms: u64,
  pub max_retries: u32,
  /// Shell command run once per queued entry, entry JSON on stdin
  pub command: Option<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_ms: DEFAULT_SYNC_INTERVAL.as_millis() as u64,
      max_retries: DEFAULT_MAX_RETRIES,
      command: None,
    }
  }
}

impl SyncConfig {
  pub fn options(&self) -> SyncOptions {
    SyncOptions::default()
      .interval(Duration::from_millis(self.interval_ms.max(1)))
      .max_retries(self.max_retries)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stashkit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stashkit/config.yaml
  ///
  /// Without a file every setting takes its default.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("stashkit.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stashkit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteMedium::default_path()
        .map_err(|e| eyre!("Cannot determine database location: {}", e)),
    }
  }

  /// Get the obfuscation secret from the environment, if set.
  pub fn get_secret() -> Option<String> {
    std::env::var(SECRET_ENV).ok().filter(|s| !s.is_empty())
  }
}
