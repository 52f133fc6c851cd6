//! The top-level data context.
//!
//! One explicitly constructed [`DataContext`] owns the cache, the breakers,
//! the retry manager, the mutation coordinator, the consistency validator,
//! and the optional persistence — nothing in this crate lives in a
//! module-level global. `init()` restores the durable snapshot and
//! `dispose()` writes it back and clears the resident cache.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::RecordApi;
use crate::cache::{
  CacheInvalidator, CacheLimits, CachePersistence, CachedValue, ConsistencyValidator, FilterSet,
  QueryKey, RecordCache, StoreError, ValidationReport,
};
use crate::error::ApiError;
use crate::mutation::MutationCoordinator;
use crate::query::{ListQuery, Query};
use crate::records::{Entry, EntryPage, EntryPatch, Payload, Privacy, StatsSummary};
use crate::resilience::{CircuitBreakerConfig, OperationCircuits, RetryManager, RetryPolicy};

const DEFAULT_PAGE_SIZE: usize = 50;

type FlightResult = Result<EntryPage, ApiError>;

/// Owns every stateful component of the data layer.
#[derive(Clone)]
pub struct DataContext {
  cache: Arc<RecordCache>,
  api: Arc<dyn RecordApi>,
  retry: RetryManager,
  circuits: Arc<OperationCircuits>,
  coordinator: Arc<MutationCoordinator>,
  validator: Arc<ConsistencyValidator>,
  invalidator: CacheInvalidator,
  persistence: Option<Arc<CachePersistence>>,
  stale_time: chrono::Duration,
  page_size: usize,
  read_policy: RetryPolicy,
  /// Single-flight registry: one leader fetch per query key, followers wait
  /// for its result instead of duplicating the call.
  inflight: Arc<Mutex<HashMap<String, broadcast::Sender<FlightResult>>>>,
}

impl DataContext {
  pub fn new(
    api: Arc<dyn RecordApi>,
    limits: CacheLimits,
    persistence: Option<CachePersistence>,
  ) -> Self {
    let cache = Arc::new(RecordCache::new(limits));
    let circuits = Arc::new(OperationCircuits::new(&CircuitBreakerConfig::default()));
    let coordinator = Arc::new(MutationCoordinator::new(
      cache.clone(),
      api.clone(),
      circuits.clone(),
    ));
    let validator = Arc::new(ConsistencyValidator::new(cache.clone()));
    let invalidator = CacheInvalidator::new(cache.clone());

    Self {
      cache,
      api,
      retry: RetryManager::new(),
      circuits,
      coordinator,
      validator,
      invalidator,
      persistence: persistence.map(Arc::new),
      stale_time: chrono::Duration::minutes(5),
      page_size: DEFAULT_PAGE_SIZE,
      read_policy: RetryPolicy::reads(),
      inflight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn with_stale_time(mut self, stale_time: chrono::Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  /// Override the retry policy used by read paths.
  pub fn with_read_policy(mut self, policy: RetryPolicy) -> Self {
    self.read_policy = policy;
    self
  }

  /// Rebuild the per-category breakers with a different configuration.
  pub fn with_circuit_config(mut self, config: &CircuitBreakerConfig) -> Self {
    self.circuits = Arc::new(OperationCircuits::new(config));
    self.coordinator = Arc::new(MutationCoordinator::new(
      self.cache.clone(),
      self.api.clone(),
      self.circuits.clone(),
    ));
    self
  }

  pub fn cache(&self) -> &RecordCache {
    &self.cache
  }

  /// Restore the durable snapshot, if persistence is configured. Returns the
  /// number of restored entries.
  pub fn init(&self) -> Result<usize, StoreError> {
    let Some(persistence) = &self.persistence else {
      return Ok(0);
    };
    let restored = persistence.restore(&self.cache)?;
    info!(restored, "data context initialized");
    Ok(restored)
  }

  /// Persist the cache and drop the resident state. Returns the number of
  /// persisted entries.
  pub fn dispose(&self) -> Result<usize, StoreError> {
    let saved = match &self.persistence {
      Some(persistence) => persistence.save(&self.cache)?,
      None => 0,
    };
    self.cache.clear();
    info!(saved, "data context disposed");
    Ok(saved)
  }

  /// Drop both the resident cache and the durable snapshot, e.g. on logout.
  pub fn wipe(&self) -> Result<(), StoreError> {
    self.cache.clear();
    if let Some(persistence) = &self.persistence {
      persistence.wipe()?;
    }
    Ok(())
  }

  // -- reads -----------------------------------------------------------------

  /// Read an author's entry listing: fresh cache is served as-is, otherwise
  /// the first page is fetched (deduplicated across concurrent callers) and
  /// merged into the cache. On network failure the last-known-good page is
  /// served instead.
  pub async fn read_list(&self, author: &str, filter: FilterSet) -> Result<EntryPage, ApiError> {
    let key = QueryKey::Entries {
      author: author.to_string(),
      filter: filter.clone(),
    };

    if let Some(page) = self.fresh_page(&key) {
      return Ok(page);
    }
    self.fetch_list(&key, author, &filter).await
  }

  /// Fetch the page after the cached one and merge it in. Returns only the
  /// newly fetched slice; the cache holds the full merged listing.
  pub async fn fetch_next_page(
    &self,
    author: &str,
    filter: FilterSet,
  ) -> Result<EntryPage, ApiError> {
    let key = QueryKey::Entries {
      author: author.to_string(),
      filter: filter.clone(),
    };

    let Some(current) = self.cache.get_page(&key) else {
      return self.fetch_list(&key, author, &filter).await;
    };
    if !current.has_more {
      return Ok(EntryPage::empty());
    }

    let token = self.cache.begin_fetch(&key);
    let cursor = current.cursor.clone();
    let fetched = self
      .retry
      .execute(&self.read_policy, "entry.list", || {
        self.circuits.list.call(|| {
          self
            .api
            .list(author, &filter, self.page_size, cursor.as_deref())
        })
      })
      .await?;

    let mut merged = current;
    merged.items.extend(fetched.items.clone());
    merged.cursor = fetched.cursor.clone();
    merged.has_more = fetched.has_more;
    // A mutation may have superseded this fetch; if so the merge is dropped
    // and the delta still goes to the caller.
    self
      .cache
      .install_if_current(&key, token, CachedValue::Page(merged));

    Ok(fetched)
  }

  /// Read one entry, cache-first with stale fallback.
  pub async fn read_one(&self, author: &str, rkey: &str) -> Result<Entry, ApiError> {
    let key = QueryKey::Entry {
      author: author.to_string(),
      rkey: rkey.to_string(),
    };

    let cached = self
      .cache
      .get(&key)
      .and_then(|slot| {
        let fresh = !slot.stale && !self.outlived(slot.updated_at);
        slot.value.as_single().cloned().map(|entry| (entry, fresh))
      });
    if let Some((entry, true)) = &cached {
      return Ok(entry.clone());
    }

    let token = self.cache.begin_fetch(&key);
    let result = self
      .retry
      .execute(&self.read_policy, "entry.get", || {
        self.circuits.get.call(|| self.api.get(author, rkey))
      })
      .await;

    match result {
      Ok(entry) => {
        self
          .cache
          .install_if_current(&key, token, CachedValue::Single(entry.clone()));
        Ok(entry)
      }
      Err(err) => match cached {
        Some((entry, _)) => {
          warn!(author, rkey, error = %err, "fetch failed, serving stale entry");
          Ok(entry)
        }
        None => Err(err),
      },
    }
  }

  /// Read the author's activity feed (most recent entries of any kind).
  pub async fn read_feed(&self, author: &str) -> Result<EntryPage, ApiError> {
    let key = QueryKey::Feed {
      author: author.to_string(),
    };
    if let Some(page) = self.fresh_page(&key) {
      return Ok(page);
    }
    self.fetch_list(&key, author, &FilterSet::default()).await
  }

  /// Aggregate counts for the author, computed from the reference listing
  /// and cached. The consistency pass cross-checks this entry later.
  pub async fn stats(&self, author: &str) -> Result<StatsSummary, ApiError> {
    let key = QueryKey::Stats {
      author: author.to_string(),
    };

    if let Some(slot) = self.cache.get(&key) {
      if !slot.stale && !self.outlived(slot.updated_at) {
        if let Some(stats) = slot.value.as_stats() {
          return Ok(stats.clone());
        }
      }
    }

    let reference = self.read_list(author, FilterSet::default()).await?;
    let stats = StatsSummary::from_entries(&reference.items);
    self.cache.set(key, CachedValue::Stats(stats.clone()));
    Ok(stats)
  }

  /// Run the consistency pass for an author on demand.
  pub fn validate(&self, author: &str) -> ValidationReport {
    self.validator.validate_author(author)
  }

  /// Run the consistency pass on an interval until the handle is aborted.
  pub fn spawn_validation_loop(
    &self,
    author: &str,
    interval: std::time::Duration,
  ) -> tokio::task::JoinHandle<()> {
    let validator = self.validator.clone();
    let author = author.to_string();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await; // the first tick fires immediately
      loop {
        ticker.tick().await;
        validator.validate_author(&author);
      }
    })
  }

  // -- writes ----------------------------------------------------------------

  pub async fn create(
    &self,
    author: &str,
    privacy: Privacy,
    payload: Payload,
  ) -> Result<Entry, ApiError> {
    self.coordinator.create(author, privacy, payload).await
  }

  pub async fn update(
    &self,
    author: &str,
    rkey: &str,
    patch: EntryPatch,
  ) -> Result<Entry, ApiError> {
    self.coordinator.update(author, rkey, patch).await
  }

  pub async fn delete(&self, author: &str, rkey: &str, permanent: bool) -> Result<(), ApiError> {
    self.coordinator.delete(author, rkey, permanent).await
  }

  /// Mark an author's caches stale without touching the server, e.g. after
  /// an out-of-band change notification.
  pub fn invalidate_author(&self, author: &str, rkey: &str) {
    self.invalidator.entry_written(author, rkey);
  }

  // -- query builders --------------------------------------------------------

  /// A [`ListQuery`] bound to this context: first fetch reads the merged
  /// listing, next-page fetches append the newly fetched slices.
  pub fn list_query(&self, author: &str, filter: FilterSet) -> ListQuery {
    let ctx = self.clone();
    let author = author.to_string();
    ListQuery::new(move |cursor| {
      let ctx = ctx.clone();
      let author = author.clone();
      let filter = filter.clone();
      async move {
        match cursor {
          None => ctx.read_list(&author, filter).await,
          Some(_) => ctx.fetch_next_page(&author, filter).await,
        }
      }
    })
  }

  /// A [`Query`] for one entry.
  pub fn entry_query(&self, author: &str, rkey: &str) -> Query<Entry> {
    let ctx = self.clone();
    let author = author.to_string();
    let rkey = rkey.to_string();
    Query::new(move || {
      let ctx = ctx.clone();
      let author = author.clone();
      let rkey = rkey.clone();
      async move { ctx.read_one(&author, &rkey).await }
    })
  }

  /// A [`Query`] for the author's aggregate counts.
  pub fn stats_query(&self, author: &str) -> Query<StatsSummary> {
    let ctx = self.clone();
    let author = author.to_string();
    Query::new(move || {
      let ctx = ctx.clone();
      let author = author.clone();
      async move { ctx.stats(&author).await }
    })
  }

  // -- internals -------------------------------------------------------------

  fn outlived(&self, updated_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - updated_at > self.stale_time
  }

  fn fresh_page(&self, key: &QueryKey) -> Option<EntryPage> {
    let slot = self.cache.get(key)?;
    if slot.stale || self.outlived(slot.updated_at) {
      return None;
    }
    slot.value.as_page().cloned()
  }

  /// Fetch the first page for `key`, deduplicated: the first caller becomes
  /// the leader and everyone else awaits its result.
  async fn fetch_list(
    &self,
    key: &QueryKey,
    author: &str,
    filter: &FilterSet,
  ) -> Result<EntryPage, ApiError> {
    let hash = key.cache_hash();

    // Subscribe under the registry lock so a leader finishing right now
    // cannot slip its result past us.
    let waiter = {
      let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
      match inflight.get(&hash) {
        Some(tx) => Some(tx.subscribe()),
        None => {
          let (tx, _) = broadcast::channel(1);
          inflight.insert(hash.clone(), tx);
          None
        }
      }
    };

    if let Some(mut rx) = waiter {
      debug!(key = %key.description(), "joining in-flight fetch");
      match rx.recv().await {
        Ok(result) => return result,
        // Leader vanished; fall back to whatever the cache holds.
        Err(_) => {
          return self
            .cache
            .get_page(key)
            .ok_or_else(|| ApiError::network("fetch was cancelled"));
        }
      }
    }

    let token = self.cache.begin_fetch(key);
    let fetched = self
      .retry
      .execute(&self.read_policy, "entry.list", || {
        self
          .circuits
          .list
          .call(|| self.api.list(author, filter, self.page_size, None))
      })
      .await;

    let outcome = match fetched {
      Ok(page) => {
        if self
          .cache
          .install_if_current(key, token, CachedValue::Page(page.clone()))
        {
          Ok(page)
        } else {
          // A mutation superseded the fetch; its view of the list wins.
          Ok(self.cache.get_page(key).unwrap_or(page))
        }
      }
      Err(err) => match self.cache.get_page(key) {
        Some(page) => {
          warn!(key = %key.description(), error = %err, "fetch failed, serving stale page");
          Ok(page)
        }
        None => Err(err),
      },
    };

    let sender = {
      let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
      inflight.remove(&hash)
    };
    if let Some(tx) = sender {
      let _ = tx.send(outcome.clone());
    }
    outcome
  }
}
