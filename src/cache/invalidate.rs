//! Hierarchical invalidation across related cache keys.
//!
//! Invalidation marks entries stale; refetching is the readers' business.
//! The one exception is a privacy downgrade, which strips the record from
//! every in-memory page synchronously so content the user just made private
//! never renders from stale cache while a refetch is in flight.

use std::sync::Arc;
use tracing::debug;

use super::key::QueryKey;
use super::store::RecordCache;

/// Invalidates the cache footprint of a single record: its own slot, the
/// owner's listings, the owner's aggregates, and the owner's feed — in that
/// fixed order, so consumers reading caches back-to-back within one tick see
/// list invalidation requested before aggregate invalidation.
#[derive(Clone)]
pub struct CacheInvalidator {
  cache: Arc<RecordCache>,
}

impl CacheInvalidator {
  pub fn new(cache: Arc<RecordCache>) -> Self {
    Self { cache }
  }

  /// A record was created or updated: stale-mark everything derived from it.
  pub fn entry_written(&self, author: &str, rkey: &str) {
    debug!(author, rkey, "invalidating after write");

    self.cache.mark_stale(&QueryKey::Entry {
      author: author.into(),
      rkey: rkey.into(),
    });

    for key in self.list_keys(author) {
      self.cache.mark_stale(&key);
    }
    self.cache.mark_stale(&QueryKey::Stats {
      author: author.into(),
    });
    self.cache.mark_stale(&QueryKey::Feed {
      author: author.into(),
    });
  }

  /// A record was deleted: remove its slot, strip it from every page, and
  /// either stale-mark the derived entries or, for permanent deletes, drop
  /// them outright.
  pub fn entry_deleted(&self, author: &str, rkey: &str, permanent: bool) {
    debug!(author, rkey, permanent, "invalidating after delete");

    self.cache.remove(&QueryKey::Entry {
      author: author.into(),
      rkey: rkey.into(),
    });
    self.strip_from_pages(author, rkey);

    let derived = self
      .list_keys(author)
      .into_iter()
      .chain([
        QueryKey::Stats {
          author: author.into(),
        },
        QueryKey::Feed {
          author: author.into(),
        },
      ]);
    for key in derived {
      if permanent {
        self.cache.remove(&key);
      } else {
        self.cache.mark_stale(&key);
      }
    }
  }

  /// A record just became sensitive: filter it out of every in-memory page
  /// immediately, then run the normal write invalidation.
  pub fn privacy_downgraded(&self, author: &str, rkey: &str) {
    debug!(author, rkey, "stripping newly-sensitive record from pages");
    self.strip_from_pages(author, rkey);
    self.entry_written(author, rkey);
  }

  fn strip_from_pages(&self, author: &str, rkey: &str) {
    for key in self.cache.page_keys_for_author(author) {
      self.cache.update_page(&key, |page| {
        page.items.retain(|entry| entry.id != rkey);
      });
    }
  }

  fn list_keys(&self, author: &str) -> Vec<QueryKey> {
    self
      .cache
      .page_keys_for_author(author)
      .into_iter()
      .filter(|key| matches!(key, QueryKey::Entries { .. }))
      .collect()
  }
}
