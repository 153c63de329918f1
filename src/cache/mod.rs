//! Bounded cache layered on the durable store.
//!
//! The cache owns nothing but its policy: entries live in the store, and the
//! cache decides expiry, obfuscation and which entry to evict when full.

mod bounded;
mod config;

pub use bounded::BoundedCache;
pub use config::{CacheConfig, CacheConfigUpdate, DEFAULT_EXPIRY_MS, DEFAULT_MAX_ENTRIES};
