//! Privacy-aware caching for journal records.
//!
//! This module holds the resident cache and everything that keeps it honest:
//! - deterministic query keys for lookups ([`key`])
//! - the store itself with tagging and pressure eviction ([`store`])
//! - hierarchical invalidation across related keys ([`invalidate`])
//! - the self-healing consistency pass ([`consistency`])
//! - optional durable snapshots behind a key-value capability ([`persist`])

pub mod consistency;
pub mod invalidate;
pub mod key;
pub mod persist;
pub mod store;

pub use consistency::{ConsistencyValidator, ValidationReport};
pub use invalidate::CacheInvalidator;
pub use key::{FilterSet, QueryKey};
pub use persist::{
  CachePersistence, EntryCipher, KeyValueStore, MemoryStore, SqliteStore, StoreError,
};
pub use store::{CacheEntry, CacheLimits, CachedValue, RecordCache};
