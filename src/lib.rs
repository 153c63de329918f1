//! Local persistence for keyed JSON values.
//!
//! A [`DurableStore`] keeps records in a pluggable [`Medium`] (SQLite by
//! default), optionally obfuscated through an [`Obfuscator`]. A
//! [`BoundedCache`] layers an entry limit and default expiry on top, and a
//! [`ReplayQueue`] records mutations made offline and replays them against a
//! [`Sink`] once connectivity returns. [`Stash`] wires the three together.

pub mod cache;
pub mod codec;
pub mod error;
pub mod medium;
pub mod stash;
pub mod store;
pub mod sync;

pub use cache::{BoundedCache, CacheConfig, CacheConfigUpdate};
pub use codec::Obfuscator;
pub use error::{Error, MediumError, Result, SinkError};
pub use medium::{Medium, MemoryMedium, SqliteMedium};
pub use stash::{Stash, WriteOptions};
pub use store::{DurableStore, StoredRecord};
pub use sync::{
  CommandSink, DrainOutcome, FnSink, Operation, QueueEntry, ReplayQueue, Sink, SyncOptions,
};
