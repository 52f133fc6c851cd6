//! jotline — resilient client-side data layer for a journaling service.
//!
//! The crate sits between UI-facing query state machines and a remote record
//! API: a privacy-aware cache with pressure eviction, bounded-backoff retries
//! behind per-category circuit breakers, an optimistic mutation protocol with
//! exact rollback, hierarchical invalidation, a self-healing consistency
//! pass, and optional encrypted-at-rest snapshots.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod mutation;
pub mod query;
pub mod records;
pub mod resilience;

pub use api::{HttpRecordApi, RecordApi};
pub use client::DataContext;
pub use error::{ApiError, ErrorKind};
pub use query::{ListQuery, Query, QueryStatus};
