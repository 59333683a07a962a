//! # Cache System
//!
//! Two tiers keyed by URL: a volatile memory tier with use-count protected
//! eviction, and a durable tier of one file per asset plus an index of
//! metadata records. [`TieredCacheStore`] coordinates them.

mod index;
mod keys;
mod memory;
mod store;
mod types;

pub use index::{CacheIndex, FileIndex, MemoryIndex};
pub use memory::{AssetLease, MemoryEntry, MemoryTier, RemoveOutcome};
pub use store::{TierStats, TieredCacheStore};
pub use types::{AssetKey, CacheConfig, CacheRecord, CacheResult, CacheState};
