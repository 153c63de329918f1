mod config;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stashkit::{
  BoundedCache, CommandSink, DrainOutcome, DurableStore, Obfuscator, ReplayQueue, SqliteMedium,
  Stash, WriteOptions,
};

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "stashkit")]
#[command(about = "Durable key-value store with a bounded cache and offline replay queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stashkit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Store a JSON value (plain strings are stored as JSON strings)
  Set {
    key: String,
    value: String,
    /// Expire the value after this many milliseconds
    #[arg(long)]
    expiry_ms: Option<u64>,
    /// Obfuscate the value at rest (needs STASHKIT_SECRET)
    #[arg(long)]
    obfuscate: bool,
    /// Go through the bounded cache
    #[arg(long)]
    cache: bool,
    /// Queue the write for the sync command
    #[arg(long)]
    sync: bool,
  },
  /// Print a stored value
  Get {
    key: String,
    #[arg(long)]
    obfuscate: bool,
    #[arg(long)]
    cache: bool,
  },
  /// Remove a key
  Rm {
    key: String,
    #[arg(long)]
    sync: bool,
  },
  /// List stored keys
  Keys,
  /// Check whether a key exists, expired or not
  Has { key: String },
  /// Number of stored keys
  Size,
  /// Remove every key, including the queue
  Clear,
  /// List queued operations
  Queue,
  /// Replay queued operations through the configured command
  Sync,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  // RUST_LOG controls the level, e.g. RUST_LOG=stashkit=debug
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "stashkit.log"));
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(config.log_dir.as_deref());

  let database = config.database_path()?;
  info!(path = %database.display(), "opening store");

  let codec = match Config::get_secret() {
    Some(secret) => Obfuscator::with_secret(&secret)?,
    None => Obfuscator::new(),
  };
  let store = Arc::new(DurableStore::new(
    SqliteMedium::open(&database)?,
    Arc::new(codec),
  ));

  // Only the sync command drains, and it refuses to run without a command.
  let sink = CommandSink::shell(config.sync.command.clone().unwrap_or_default());
  let queue = ReplayQueue::open(store.clone(), sink).await;
  let stash = Stash::new(BoundedCache::new(store, config.cache), queue);

  run(&stash, &config, args.command).await
}

async fn run(stash: &Stash<SqliteMedium, CommandSink>, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::Set {
      key,
      value,
      expiry_ms,
      obfuscate,
      cache,
      sync,
    } => {
      let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
      let mut options = WriteOptions::default()
        .obfuscate(obfuscate)
        .cache(cache)
        .sync(sync);
      if let Some(ms) = expiry_ms {
        options = options.expiry(Duration::from_millis(ms));
      }
      stash.write(&key, &value, options).await?;
    }
    Command::Get {
      key,
      obfuscate,
      cache,
    } => {
      let options = WriteOptions::default().obfuscate(obfuscate).cache(cache);
      let value: Value = stash
        .read(&key, options)
        .await?
        .ok_or_else(|| eyre!("Key not found: {}", key))?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::Rm { key, sync } => {
      stash.delete(&key, WriteOptions::default().sync(sync)).await?;
    }
    Command::Keys => {
      for key in stash.store().all_keys().await {
        println!("{}", key);
      }
    }
    Command::Has { key } => {
      println!("{}", stash.cache().has(&key).await);
    }
    Command::Size => {
      println!("{}", stash.cache().size().await);
    }
    Command::Clear => {
      stash.cache().clear().await?;
    }
    Command::Queue => {
      for entry in stash.queue().pending_operations() {
        println!("{}", serde_json::to_string(&entry)?);
      }
    }
    Command::Sync => {
      if config.sync.command.is_none() {
        return Err(eyre!(
          "No sync command configured. Set sync.command in the config file."
        ));
      }

      let queue = stash.queue();
      queue.configure(config.sync.options());
      let outcome = queue.drain().await;
      queue.stop();

      match outcome {
        DrainOutcome::Empty => println!("Nothing to sync"),
        DrainOutcome::Synced { applied, attempts } => {
          println!("Synced {} operation(s) in {} attempt(s)", applied, attempts)
        }
        DrainOutcome::Failed { attempts, error } => {
          return Err(eyre!(error).wrap_err(format!("Sync failed after {} attempt(s)", attempts)));
        }
      }
    }
  }

  Ok(())
}
