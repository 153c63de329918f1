//! External sinks that queued entries are replayed against.

use async_trait::async_trait;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::types::QueueEntry;
use crate::error::SinkError;

/// Destination for queued mutations. One call per entry; any error fails the
/// entry for the current drain pass.
#[async_trait]
pub trait Sink: Send + Sync {
  async fn apply(&self, entry: &QueueEntry) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for Arc<T> {
  async fn apply(&self, entry: &QueueEntry) -> Result<(), SinkError> {
    (**self).apply(entry).await
  }
}

/// Sink backed by an async closure.
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F, Fut> Sink for FnSink<F>
where
  F: Fn(QueueEntry) -> Fut + Send + Sync,
  Fut: Future<Output = Result<(), SinkError>> + Send + 'static,
{
  async fn apply(&self, entry: &QueueEntry) -> Result<(), SinkError> {
    (self.0)(entry.clone()).await
  }
}

/// Sink that runs a program once per entry.
///
/// The entry is written to the program's stdin as JSON, and `STASHKIT_KEY` /
/// `STASHKIT_OPERATION` are set in its environment. A non-zero exit status
/// fails the entry.
#[derive(Debug, Clone)]
pub struct CommandSink {
  program: String,
  args: Vec<String>,
}

impl CommandSink {
  pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
    Self {
      program: program.into(),
      args,
    }
  }

  /// Run `command` through `sh -c`.
  pub fn shell(command: impl Into<String>) -> Self {
    Self::new("sh", vec!["-c".to_string(), command.into()])
  }
}

#[async_trait]
impl Sink for CommandSink {
  async fn apply(&self, entry: &QueueEntry) -> Result<(), SinkError> {
    let payload = serde_json::to_vec(entry)?;

    let mut child = Command::new(&self.program)
      .args(&self.args)
      .env("STASHKIT_KEY", &entry.key)
      .env("STASHKIT_OPERATION", entry.operation.to_string())
      .stdin(Stdio::piped())
      .stdout(Stdio::null())
      .stderr(Stdio::inherit())
      .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
      // The program may exit without reading its input.
      if let Err(e) = stdin.write_all(&payload).await {
        debug!(key = %entry.key, error = %e, "sink command did not read stdin");
      }
    }

    let status = child.wait().await?;
    if !status.success() {
      return Err(format!("{} exited with {}", self.program, status).into());
    }
    Ok(())
  }
}
