//! The remote record API collaborator.
//!
//! The data layer only ever talks to the record store through [`RecordApi`],
//! so tests script failures freely and the transport stays swappable. None of
//! these operations are idempotency-aware; retrying a create can duplicate,
//! which is why the mutation layer bounds create retries and the consistency
//! pass repairs duplicates after the fact.

mod http;

pub use http::HttpRecordApi;

use async_trait::async_trait;

use crate::cache::FilterSet;
use crate::error::ApiError;
use crate::records::{Entry, EntryPage, EntryPatch, Payload, Privacy};

/// Identity assigned by the server on create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRecord {
  pub id: String,
  pub uri: String,
  pub revision: String,
}

/// Remote CRUD surface for journal records.
#[async_trait]
pub trait RecordApi: Send + Sync {
  /// Fetch one page of an author's entries.
  async fn list(
    &self,
    author: &str,
    filter: &FilterSet,
    limit: usize,
    cursor: Option<&str>,
  ) -> Result<EntryPage, ApiError>;

  /// Fetch a single entry.
  async fn get(&self, author: &str, rkey: &str) -> Result<Entry, ApiError>;

  /// Create an entry; the server assigns id, uri, and the first revision.
  async fn create(
    &self,
    author: &str,
    privacy: Privacy,
    payload: &Payload,
  ) -> Result<CreatedRecord, ApiError>;

  /// Update an entry. `expected_revision` is the revision the client last
  /// read; the server rejects with a conflict when it no longer matches.
  async fn update(
    &self,
    author: &str,
    rkey: &str,
    expected_revision: &str,
    patch: &EntryPatch,
  ) -> Result<Entry, ApiError>;

  /// Delete an entry, with the same revision guard as update.
  async fn delete(
    &self,
    author: &str,
    rkey: &str,
    expected_revision: Option<&str>,
  ) -> Result<(), ApiError>;
}
