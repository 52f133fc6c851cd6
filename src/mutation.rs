//! Optimistic write orchestration against the remote record API.
//!
//! Every mutation is a three-phase transaction: capture what the cache held,
//! apply the optimistic change, then either promote to the authoritative
//! server result or roll the cache back to exactly what was captured. The
//! transaction values ([`CreateTxn`], [`UpdateTxn`]) are plain data and work
//! against the cache alone, so both halves of the protocol are testable
//! without the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::RecordApi;
use crate::cache::{CacheEntry, CacheInvalidator, CachedValue, QueryKey, RecordCache};
use crate::error::ApiError;
use crate::records::{Entry, EntryPatch, Payload, Privacy};
use crate::resilience::{OperationCircuits, RetryManager, RetryPolicy};

/// Optimistic-create transaction: remembers the temp identity and which page
/// slots received the placeholder, so promote and rollback touch exactly
/// those slots.
pub struct CreateTxn {
  temp_id: String,
  author: String,
  targets: Vec<QueryKey>,
}

impl CreateTxn {
  /// Insert `optimistic` at the head of every page that would list it.
  /// In-flight reads for those keys are cancelled first so a refetch that
  /// races the insert cannot clobber it.
  pub fn begin(cache: &RecordCache, author: &str, optimistic: &Entry) -> Self {
    let targets: Vec<QueryKey> = cache
      .page_keys_for_author(author)
      .into_iter()
      .filter(|key| match key {
        QueryKey::Entries { filter, .. } => {
          filter.admits(optimistic.kind(), optimistic.privacy)
        }
        QueryKey::Feed { .. } => true,
        _ => false,
      })
      .collect();

    for key in &targets {
      cache.cancel_fetches(key);
      cache.update_page(key, |page| page.items.insert(0, optimistic.clone()));
    }

    Self {
      temp_id: optimistic.id.clone(),
      author: author.to_string(),
      targets,
    }
  }

  /// Swap the placeholder for the authoritative record everywhere it was
  /// inserted, and publish the single-record slot.
  pub fn promote(self, cache: &RecordCache, authoritative: &Entry) {
    for key in &self.targets {
      cache.update_page(key, |page| {
        for item in &mut page.items {
          if item.id == self.temp_id {
            *item = authoritative.clone();
          }
        }
      });
    }
    cache.set(
      QueryKey::Entry {
        author: self.author,
        rkey: authoritative.id.clone(),
      },
      CachedValue::Single(authoritative.clone()),
    );
  }

  /// Remove the placeholder from every slot it was inserted into. Nothing
  /// pending survives a failed create.
  pub fn rollback(self, cache: &RecordCache) {
    for key in &self.targets {
      cache.update_page(key, |page| {
        page.items.retain(|item| item.id != self.temp_id);
      });
    }
  }
}

/// Optimistic-update transaction: an exact snapshot of the single-record
/// slot, restored verbatim on rollback rather than reconstructed.
pub struct UpdateTxn {
  key: QueryKey,
  snapshot: Option<CacheEntry>,
}

impl UpdateTxn {
  pub fn capture(cache: &RecordCache, author: &str, rkey: &str) -> Self {
    let key = QueryKey::Entry {
      author: author.to_string(),
      rkey: rkey.to_string(),
    };
    Self {
      snapshot: cache.get(&key),
      key,
    }
  }

  /// The entry the cache held when the transaction began, if any.
  pub fn snapshot_entry(&self) -> Option<Entry> {
    self
      .snapshot
      .as_ref()
      .and_then(|slot| slot.value.as_single().cloned())
  }

  pub fn apply(&self, cache: &RecordCache, patched: Entry) {
    cache.set(self.key.clone(), CachedValue::Single(patched));
  }

  pub fn rollback(self, cache: &RecordCache) {
    match self.snapshot {
      Some(slot) => cache.reinstall(slot),
      None => {
        cache.remove(&self.key);
      }
    }
  }
}

/// Orchestrates create/update/delete with optimistic cache updates,
/// per-category circuit breaking, bounded retries, and invalidation.
pub struct MutationCoordinator {
  cache: Arc<RecordCache>,
  api: Arc<dyn RecordApi>,
  retry: RetryManager,
  circuits: Arc<OperationCircuits>,
  invalidator: CacheInvalidator,
  write_policy: RetryPolicy,
  /// Deletes get a single attempt: a retried delete that already succeeded
  /// server-side would surface as a duplicate side effect.
  delete_policy: RetryPolicy,
  temp_seq: AtomicU64,
}

impl MutationCoordinator {
  pub fn new(
    cache: Arc<RecordCache>,
    api: Arc<dyn RecordApi>,
    circuits: Arc<OperationCircuits>,
  ) -> Self {
    let invalidator = CacheInvalidator::new(cache.clone());
    Self {
      cache,
      api,
      retry: RetryManager::new(),
      circuits,
      invalidator,
      write_policy: RetryPolicy::writes(),
      delete_policy: RetryPolicy::none(),
      temp_seq: AtomicU64::new(1),
    }
  }

  #[cfg(test)]
  pub fn with_write_policy(mut self, policy: RetryPolicy) -> Self {
    self.write_policy = policy;
    self
  }

  /// Create an entry. The caller sees the optimistic insert immediately;
  /// the returned entry is the authoritative one.
  pub async fn create(
    &self,
    author: &str,
    privacy: Privacy,
    payload: Payload,
  ) -> Result<Entry, ApiError> {
    let temp_id = format!("temp-{}", self.temp_seq.fetch_add(1, Ordering::Relaxed));
    let optimistic = Entry::optimistic(temp_id, privacy, payload.clone());
    let txn = CreateTxn::begin(&self.cache, author, &optimistic);

    let result = self
      .retry
      .execute(&self.write_policy, "entry.create", || {
        self
          .circuits
          .create
          .call(|| self.api.create(author, privacy, &payload))
      })
      .await;

    match result {
      Ok(created) => {
        let authoritative = Entry {
          id: created.id,
          uri: created.uri,
          revision: created.revision,
          privacy,
          created_at: optimistic.created_at,
          payload,
          pending: false,
        };
        debug!(author, id = %authoritative.id, "create confirmed, promoting");
        txn.promote(&self.cache, &authoritative);
        self.invalidator.entry_written(author, &authoritative.id);
        Ok(authoritative)
      }
      Err(err) => {
        warn!(author, error = %err, "create failed, rolling back optimistic insert");
        txn.rollback(&self.cache);
        Err(err)
      }
    }
  }

  /// Update an entry. The patch is applied optimistically to the cached
  /// record; on failure the pre-mutation snapshot is restored exactly.
  pub async fn update(
    &self,
    author: &str,
    rkey: &str,
    patch: EntryPatch,
  ) -> Result<Entry, ApiError> {
    let txn = UpdateTxn::capture(&self.cache, author, rkey);
    let current = txn.snapshot_entry();
    let expected_revision = current
      .as_ref()
      .map(|entry| entry.revision.clone())
      .unwrap_or_default();
    let was_public = current
      .as_ref()
      .map(|entry| entry.privacy == Privacy::Public)
      .unwrap_or(false);

    if let Some(mut patched) = current {
      patch.apply_to(&mut patched);
      txn.apply(&self.cache, patched);
    }

    let result = self
      .retry
      .execute(&self.write_policy, "entry.update", || {
        self
          .circuits
          .update
          .call(|| self.api.update(author, rkey, &expected_revision, &patch))
      })
      .await;

    match result {
      Ok(authoritative) => {
        self.cache.set(
          QueryKey::Entry {
            author: author.to_string(),
            rkey: rkey.to_string(),
          },
          CachedValue::Single(authoritative.clone()),
        );
        self.propagate_to_pages(author, &authoritative);

        if was_public && authoritative.privacy == Privacy::Sensitive {
          self.invalidator.privacy_downgraded(author, rkey);
        } else {
          self.invalidator.entry_written(author, rkey);
        }
        Ok(authoritative)
      }
      Err(err) => {
        warn!(author, rkey, error = %err, "update failed, restoring snapshot");
        txn.rollback(&self.cache);
        Err(err)
      }
    }
  }

  /// Delete an entry. Never retried; a failed delete surfaces to the caller.
  /// `permanent` removes the related query entries outright instead of
  /// leaving stale-marked tombstones.
  pub async fn delete(&self, author: &str, rkey: &str, permanent: bool) -> Result<(), ApiError> {
    let expected_revision = self
      .cache
      .get(&QueryKey::Entry {
        author: author.to_string(),
        rkey: rkey.to_string(),
      })
      .and_then(|slot| slot.value.as_single().map(|entry| entry.revision.clone()));

    self
      .retry
      .execute(&self.delete_policy, "entry.delete", || {
        self
          .circuits
          .delete
          .call(|| self.api.delete(author, rkey, expected_revision.as_deref()))
      })
      .await?;

    self.invalidator.entry_deleted(author, rkey, permanent);
    Ok(())
  }

  fn propagate_to_pages(&self, author: &str, authoritative: &Entry) {
    for key in self.cache.page_keys_for_author(author) {
      self.cache.update_page(&key, |page| {
        for item in &mut page.items {
          if item.id == authoritative.id {
            *item = authoritative.clone();
          }
        }
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::CreatedRecord;
  use crate::cache::{CacheLimits, FilterSet};
  use crate::records::test_support::{entry, page};
  use crate::resilience::CircuitBreakerConfig;
  use async_trait::async_trait;
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicU32;
  use std::sync::Mutex;

  /// Record API double with scripted responses per operation.
  #[derive(Default)]
  struct ScriptedApi {
    create_results: Mutex<VecDeque<Result<CreatedRecord, ApiError>>>,
    update_results: Mutex<VecDeque<Result<Entry, ApiError>>>,
    delete_results: Mutex<VecDeque<Result<(), ApiError>>>,
    create_calls: AtomicU32,
    update_calls: AtomicU32,
    delete_calls: AtomicU32,
  }

  impl ScriptedApi {
    fn script_create(&self, result: Result<CreatedRecord, ApiError>) {
      self.create_results.lock().unwrap().push_back(result);
    }

    fn script_update(&self, result: Result<Entry, ApiError>) {
      self.update_results.lock().unwrap().push_back(result);
    }

    fn script_delete(&self, result: Result<(), ApiError>) {
      self.delete_results.lock().unwrap().push_back(result);
    }
  }

  #[async_trait]
  impl RecordApi for ScriptedApi {
    async fn list(
      &self,
      _author: &str,
      _filter: &FilterSet,
      _limit: usize,
      _cursor: Option<&str>,
    ) -> Result<crate::records::EntryPage, ApiError> {
      Ok(crate::records::EntryPage::empty())
    }

    async fn get(&self, _author: &str, rkey: &str) -> Result<Entry, ApiError> {
      Ok(entry(rkey, "fetched"))
    }

    async fn create(
      &self,
      _author: &str,
      _privacy: Privacy,
      _payload: &Payload,
    ) -> Result<CreatedRecord, ApiError> {
      self.create_calls.fetch_add(1, Ordering::SeqCst);
      self
        .create_results
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(ApiError::server("unscripted create")))
    }

    async fn update(
      &self,
      _author: &str,
      _rkey: &str,
      _expected_revision: &str,
      _patch: &EntryPatch,
    ) -> Result<Entry, ApiError> {
      self.update_calls.fetch_add(1, Ordering::SeqCst);
      self
        .update_results
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(ApiError::server("unscripted update")))
    }

    async fn delete(
      &self,
      _author: &str,
      _rkey: &str,
      _expected_revision: Option<&str>,
    ) -> Result<(), ApiError> {
      self.delete_calls.fetch_add(1, Ordering::SeqCst);
      self
        .delete_results
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(ApiError::server("unscripted delete")))
    }
  }

  fn list_key() -> QueryKey {
    QueryKey::Entries {
      author: "alice".into(),
      filter: FilterSet::default(),
    }
  }

  fn setup() -> (Arc<RecordCache>, Arc<ScriptedApi>, MutationCoordinator) {
    let cache = Arc::new(RecordCache::new(CacheLimits::default()));
    let api = Arc::new(ScriptedApi::default());
    let circuits = Arc::new(OperationCircuits::new(&CircuitBreakerConfig::default()));
    let coordinator = MutationCoordinator::new(cache.clone(), api.clone(), circuits)
      .with_write_policy(RetryPolicy::test());
    (cache, api, coordinator)
  }

  fn seed_public_list(cache: &RecordCache) -> Vec<Entry> {
    let items = vec![entry("a", "one"), entry("b", "two"), entry("c", "three")];
    cache.set(list_key(), CachedValue::Page(page(items.clone())));
    items
  }

  #[test]
  fn create_txn_inserts_pending_placeholder_at_head() {
    let cache = RecordCache::new(CacheLimits::default());
    seed_public_list(&cache);

    let optimistic = Entry::optimistic(
      "temp-9".into(),
      Privacy::Sensitive,
      Payload::Note { text: "A".into() },
    );
    let txn = CreateTxn::begin(&cache, "alice", &optimistic);

    let items = cache.get_page(&list_key()).unwrap().items;
    assert_eq!(items.len(), 4);
    assert!(items[0].pending);
    assert_eq!(items[0].id, "temp-9");
    assert_eq!(items[0].payload.text(), "A");

    txn.rollback(&cache);
    let items = cache.get_page(&list_key()).unwrap().items;
    assert_eq!(items.len(), 3);
  }

  #[test]
  fn create_txn_skips_lists_that_would_not_show_the_entry() {
    let cache = RecordCache::new(CacheLimits::default());
    let sensitive_only = QueryKey::Entries {
      author: "alice".into(),
      filter: FilterSet {
        privacy: Some(Privacy::Sensitive),
        ..FilterSet::default()
      },
    };
    cache.set(sensitive_only.clone(), CachedValue::Page(page(vec![])));
    seed_public_list(&cache);

    let optimistic = Entry::optimistic(
      "temp-1".into(),
      Privacy::Public,
      Payload::Note { text: "A".into() },
    );
    let _txn = CreateTxn::begin(&cache, "alice", &optimistic);

    assert!(cache.get_page(&sensitive_only).unwrap().items.is_empty());
    assert_eq!(cache.get_page(&list_key()).unwrap().items.len(), 4);
  }

  #[tokio::test]
  async fn successful_create_promotes_and_leaves_no_placeholder() {
    let (cache, api, coordinator) = setup();
    seed_public_list(&cache);
    api.script_create(Ok(CreatedRecord {
      id: "r-new".into(),
      uri: "at://alice/journal/r-new".into(),
      revision: "rev-1".into(),
    }));

    let created = coordinator
      .create(
        "alice",
        Privacy::Public,
        Payload::Note { text: "A".into() },
      )
      .await
      .unwrap();

    assert_eq!(created.id, "r-new");
    assert!(!created.pending);

    let items = cache.get_page(&list_key()).unwrap().items;
    assert_eq!(items.len(), 4);
    assert_eq!(items[0].id, "r-new");
    assert!(items.iter().all(|item| !item.pending));

    // Single-record slot published and lists stale-marked for refetch.
    let single = cache
      .get(&QueryKey::Entry {
        author: "alice".into(),
        rkey: "r-new".into(),
      })
      .unwrap();
    assert_eq!(single.value.as_single().unwrap().revision, "rev-1");
    assert!(cache.get(&list_key()).unwrap().stale);
  }

  #[tokio::test]
  async fn failed_create_restores_the_original_list() {
    let (cache, api, coordinator) = setup();
    let original = seed_public_list(&cache);
    for _ in 0..4 {
      api.script_create(Err(ApiError::server("boom")));
    }

    let result = coordinator
      .create(
        "alice",
        Privacy::Sensitive,
        Payload::Note { text: "A".into() },
      )
      .await;

    assert!(result.is_err());
    let items = cache.get_page(&list_key()).unwrap().items;
    assert_eq!(items, original);
  }

  #[tokio::test]
  async fn create_supersedes_in_flight_reads_for_its_lists() {
    let (cache, api, coordinator) = setup();
    seed_public_list(&cache);
    api.script_create(Ok(CreatedRecord {
      id: "r-new".into(),
      uri: "at://alice/journal/r-new".into(),
      revision: "rev-1".into(),
    }));

    // A background refetch began before the mutation...
    let token = cache.begin_fetch(&list_key());

    coordinator
      .create(
        "alice",
        Privacy::Public,
        Payload::Note { text: "A".into() },
      )
      .await
      .unwrap();

    // ...so its late result must not clobber the promoted list.
    let installed =
      cache.install_if_current(&list_key(), token, CachedValue::Page(page(vec![])));
    assert!(!installed);
    assert_eq!(cache.get_page(&list_key()).unwrap().items.len(), 4);
  }

  #[tokio::test]
  async fn update_applies_optimistically_and_installs_authoritative_result() {
    let (cache, api, coordinator) = setup();
    seed_public_list(&cache);
    let key = QueryKey::Entry {
      author: "alice".into(),
      rkey: "b".into(),
    };
    cache.set(key.clone(), CachedValue::Single(entry("b", "two")));

    let mut server_entry = entry("b", "two!");
    server_entry.revision = "rev-b2".into();
    api.script_update(Ok(server_entry));

    let updated = coordinator
      .update(
        "alice",
        "b",
        EntryPatch {
          text: Some("two!".into()),
          privacy: None,
        },
      )
      .await
      .unwrap();

    assert_eq!(updated.revision, "rev-b2");
    let single = cache.get(&key).unwrap();
    assert_eq!(single.value.as_single().unwrap().payload.text(), "two!");

    // The change propagated into the listing as well.
    let items = cache.get_page(&list_key()).unwrap().items;
    let in_list = items.iter().find(|item| item.id == "b").unwrap();
    assert_eq!(in_list.revision, "rev-b2");
  }

  #[tokio::test]
  async fn failed_update_restores_the_exact_snapshot() {
    let (cache, api, coordinator) = setup();
    let key = QueryKey::Entry {
      author: "alice".into(),
      rkey: "b".into(),
    };
    cache.set(key.clone(), CachedValue::Single(entry("b", "two")));
    let before = cache.get(&key).unwrap();
    for _ in 0..4 {
      api.script_update(Err(ApiError::network("offline")));
    }

    let result = coordinator
      .update(
        "alice",
        "b",
        EntryPatch {
          text: Some("changed".into()),
          privacy: None,
        },
      )
      .await;

    assert!(result.is_err());
    assert_eq!(cache.get(&key).unwrap(), before);
  }

  #[tokio::test]
  async fn conflict_surfaces_after_rollback() {
    let (cache, api, coordinator) = setup();
    let key = QueryKey::Entry {
      author: "alice".into(),
      rkey: "b".into(),
    };
    cache.set(key.clone(), CachedValue::Single(entry("b", "two")));
    let before = cache.get(&key).unwrap();
    for _ in 0..4 {
      api.script_update(Err(ApiError::conflict("revision mismatch")));
    }

    let err = coordinator
      .update(
        "alice",
        "b",
        EntryPatch {
          text: Some("changed".into()),
          privacy: None,
        },
      )
      .await
      .unwrap_err();

    assert!(err.is_conflict());
    assert!(!err.retryable);
    assert_eq!(cache.get(&key).unwrap(), before);
  }

  #[tokio::test]
  async fn privacy_downgrade_strips_record_from_pages() {
    let (cache, api, coordinator) = setup();
    seed_public_list(&cache);
    let key = QueryKey::Entry {
      author: "alice".into(),
      rkey: "b".into(),
    };
    cache.set(key.clone(), CachedValue::Single(entry("b", "two")));

    let mut server_entry = entry("b", "two");
    server_entry.privacy = Privacy::Sensitive;
    server_entry.revision = "rev-b2".into();
    api.script_update(Ok(server_entry));

    coordinator
      .update(
        "alice",
        "b",
        EntryPatch {
          text: None,
          privacy: Some(Privacy::Sensitive),
        },
      )
      .await
      .unwrap();

    // Stripped synchronously, not waiting for a refetch.
    let items = cache.get_page(&list_key()).unwrap().items;
    assert!(items.iter().all(|item| item.id != "b"));
  }

  #[tokio::test]
  async fn delete_is_never_retried() {
    let (cache, api, coordinator) = setup();
    seed_public_list(&cache);
    api.script_delete(Err(ApiError::network("offline")));

    let result = coordinator.delete("alice", "b", false).await;

    assert!(result.is_err());
    assert_eq!(api.delete_calls.load(Ordering::SeqCst), 1);
    // The cache is untouched on a failed delete.
    assert_eq!(cache.get_page(&list_key()).unwrap().items.len(), 3);
  }

  #[tokio::test]
  async fn successful_delete_removes_everywhere() {
    let (cache, api, coordinator) = setup();
    seed_public_list(&cache);
    cache.set(
      QueryKey::Entry {
        author: "alice".into(),
        rkey: "b".into(),
      },
      CachedValue::Single(entry("b", "two")),
    );
    api.script_delete(Ok(()));

    coordinator.delete("alice", "b", false).await.unwrap();

    let items = cache.get_page(&list_key()).unwrap().items;
    assert!(items.iter().all(|item| item.id != "b"));
    assert!(cache
      .get(&QueryKey::Entry {
        author: "alice".into(),
        rkey: "b".into(),
      })
      .is_none());
  }

  #[tokio::test]
  async fn permanent_delete_drops_query_entries() {
    let (cache, api, coordinator) = setup();
    seed_public_list(&cache);
    api.script_delete(Ok(()));

    coordinator.delete("alice", "b", true).await.unwrap();
    assert!(cache.get(&list_key()).is_none());
  }
}
