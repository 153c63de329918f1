//! Offline replay queue.
//!
//! Mutations made while offline are recorded as [`QueueEntry`] intents,
//! persisted through the durable store, and replayed against a [`Sink`] once
//! connectivity returns or the periodic trigger fires.

mod queue;
mod sink;
mod types;

pub use queue::{ReplayQueue, QUEUE_KEY};
pub use sink::{CommandSink, FnSink, Sink};
pub use types::{
  CompleteCallback, ConnectivityState, DrainOutcome, DrainState, ErrorCallback, Operation,
  QueueEntry, SyncOptions, DEFAULT_MAX_RETRIES, DEFAULT_SYNC_INTERVAL,
};
