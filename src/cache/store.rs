//! In-memory record cache: privacy-aware tagging, size-pressure eviction,
//! and supersession of in-flight reads.
//!
//! The cache is the only shared mutable resource in the data layer. Every
//! operation takes the lock, completes synchronously, and releases it; no
//! caller ever holds the lock across an await. Retrieval hands out clones, so
//! updates always go through copy-and-replace via the methods here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::key::QueryKey;
use crate::records::{Entry, EntryPage, Privacy, StatsSummary};

/// Fallback size estimate when serialization fails.
const FALLBACK_ENTRY_SIZE: usize = 512;

/// Share of the non-sensitive candidate set removed per eviction pass.
const EVICTION_FRACTION: f64 = 0.25;

/// A cached value: one record, one merged listing, or an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedValue {
  Single(Entry),
  Page(EntryPage),
  Stats(StatsSummary),
}

impl CachedValue {
  pub fn as_single(&self) -> Option<&Entry> {
    match self {
      Self::Single(entry) => Some(entry),
      _ => None,
    }
  }

  pub fn as_page(&self) -> Option<&EntryPage> {
    match self {
      Self::Page(page) => Some(page),
      _ => None,
    }
  }

  pub fn as_stats(&self) -> Option<&StatsSummary> {
    match self {
      Self::Stats(stats) => Some(stats),
      _ => None,
    }
  }

  /// Whether any contained record carries the sensitive privacy tag.
  fn contains_sensitive(&self) -> bool {
    match self {
      Self::Single(entry) => entry.privacy == Privacy::Sensitive,
      Self::Page(page) => page.items.iter().any(|e| e.privacy == Privacy::Sensitive),
      Self::Stats(_) => false,
    }
  }

  /// Whether any contained record is an unresolved optimistic insert.
  pub fn contains_pending(&self) -> bool {
    match self {
      Self::Single(entry) => entry.pending,
      Self::Page(page) => page.items.iter().any(|e| e.pending),
      Self::Stats(_) => false,
    }
  }

  fn estimated_size(&self) -> usize {
    serde_json::to_vec(self)
      .map(|bytes| bytes.len())
      .unwrap_or(FALLBACK_ENTRY_SIZE)
  }
}

/// A cache slot with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: QueryKey,
  pub value: CachedValue,
  pub updated_at: DateTime<Utc>,
  pub sensitive: bool,
  /// Stale entries are still served but should be refetched
  pub stale: bool,
  pub size: usize,
}

/// Size limits for the in-memory cache.
#[derive(Debug, Clone)]
pub struct CacheLimits {
  pub max_size: usize,
  /// Eviction triggers when estimated size exceeds `max_size * pressure_threshold`
  pub pressure_threshold: f64,
}

impl Default for CacheLimits {
  fn default() -> Self {
    Self {
      max_size: 4 * 1024 * 1024,
      pressure_threshold: 0.8,
    }
  }
}

struct CacheInner {
  entries: HashMap<String, CacheEntry>,
  sensitive_keys: HashSet<String>,
  total_size: usize,
  /// Per-key epoch used to supersede in-flight reads
  fetch_epochs: HashMap<String, u64>,
}

/// The shared record cache.
pub struct RecordCache {
  limits: CacheLimits,
  inner: Mutex<CacheInner>,
}

impl RecordCache {
  pub fn new(limits: CacheLimits) -> Self {
    Self {
      limits,
      inner: Mutex::new(CacheInner {
        entries: HashMap::new(),
        sensitive_keys: HashSet::new(),
        total_size: 0,
        fetch_epochs: HashMap::new(),
      }),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
    self.inner.lock().expect("cache lock poisoned")
  }

  /// Fetch a clone of the slot for `key`. Mutating the clone does not touch
  /// the cache; write back through [`set`](Self::set) or
  /// [`update_page`](Self::update_page).
  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().entries.get(&key.cache_hash()).cloned()
  }

  pub fn get_page(&self, key: &QueryKey) -> Option<EntryPage> {
    self
      .get(key)
      .and_then(|entry| entry.value.as_page().cloned())
  }

  /// Install a value, refreshing its timestamp and clearing staleness.
  /// Triggers an eviction pass when the write pushes the cache over the
  /// pressure threshold.
  pub fn set(&self, key: QueryKey, value: CachedValue) {
    let mut inner = self.lock();
    Self::write_entry(&mut inner, key, value, Utc::now(), false);
    self.evict_if_pressured(&mut inner);
  }

  /// Reinstall a slot exactly as captured, bookkeeping included. Used by
  /// rollback paths and snapshot restore.
  pub fn reinstall(&self, entry: CacheEntry) {
    let mut inner = self.lock();
    let hash = entry.key.cache_hash();
    Self::detach(&mut inner, &hash);
    if entry.sensitive {
      inner.sensitive_keys.insert(hash.clone());
    }
    inner.total_size += entry.size;
    inner.entries.insert(hash, entry);
  }

  /// Install a restored snapshot entry with its original timestamp so
  /// staleness still means what it meant before shutdown.
  pub fn restore(&self, key: QueryKey, value: CachedValue, updated_at: DateTime<Utc>) {
    let mut inner = self.lock();
    Self::write_entry(&mut inner, key, value, updated_at, false);
  }

  pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry> {
    let mut inner = self.lock();
    Self::detach(&mut inner, &key.cache_hash())
  }

  /// Mark a slot stale so the next read refetches. Returns false when the
  /// slot is absent.
  pub fn mark_stale(&self, key: &QueryKey) -> bool {
    let mut inner = self.lock();
    match inner.entries.get_mut(&key.cache_hash()) {
      Some(entry) => {
        entry.stale = true;
        true
      }
      None => false,
    }
  }

  /// Atomic read-modify-write of a page slot. The closure runs under the
  /// cache lock and must not block. Returns false when the slot is absent or
  /// not a page.
  pub fn update_page<F>(&self, key: &QueryKey, mutate: F) -> bool
  where
    F: FnOnce(&mut EntryPage),
  {
    let mut inner = self.lock();
    let hash = key.cache_hash();

    let Some(entry) = inner.entries.get(&hash) else {
      return false;
    };
    let CachedValue::Page(mut page) = entry.value.clone() else {
      return false;
    };
    let stale = entry.stale;

    mutate(&mut page);
    Self::write_entry(&mut inner, key.clone(), CachedValue::Page(page), Utc::now(), stale);
    true
  }

  /// All page slots belonging to `author`, in no particular order.
  pub fn page_keys_for_author(&self, author: &str) -> Vec<QueryKey> {
    self
      .lock()
      .entries
      .values()
      .filter(|entry| entry.key.is_page() && entry.key.author() == author)
      .map(|entry| entry.key.clone())
      .collect()
  }

  /// Snapshot of every slot, for persistence and the consistency pass.
  pub fn all_entries(&self) -> Vec<CacheEntry> {
    self.lock().entries.values().cloned().collect()
  }

  pub fn clear(&self) {
    let mut inner = self.lock();
    inner.entries.clear();
    inner.sensitive_keys.clear();
    inner.total_size = 0;
    inner.fetch_epochs.clear();
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }

  pub fn estimated_size(&self) -> usize {
    self.lock().total_size
  }

  pub fn sensitive_count(&self) -> usize {
    self.lock().sensitive_keys.len()
  }

  // -- in-flight read supersession ------------------------------------------

  /// Register the start of a background fetch for `key`, returning the token
  /// the result must present to be installed.
  pub fn begin_fetch(&self, key: &QueryKey) -> u64 {
    *self
      .lock()
      .fetch_epochs
      .entry(key.cache_hash())
      .or_insert(0)
  }

  /// Install a fetched value only if no mutation superseded the fetch since
  /// `token` was issued. Returns whether the value was installed.
  pub fn install_if_current(&self, key: &QueryKey, token: u64, value: CachedValue) -> bool {
    let mut inner = self.lock();
    let current = inner.fetch_epochs.get(&key.cache_hash()).copied().unwrap_or(0);
    if current != token {
      debug!(key = %key.description(), "fetch superseded, result discarded");
      return false;
    }
    Self::write_entry(&mut inner, key.clone(), value, Utc::now(), false);
    self.evict_if_pressured(&mut inner);
    true
  }

  /// Cancel outstanding fetches for `key`: any result begun before this call
  /// will be discarded on arrival.
  pub fn cancel_fetches(&self, key: &QueryKey) {
    let mut inner = self.lock();
    *inner.fetch_epochs.entry(key.cache_hash()).or_insert(0) += 1;
  }

  // -- internals -------------------------------------------------------------

  fn write_entry(
    inner: &mut CacheInner,
    key: QueryKey,
    value: CachedValue,
    updated_at: DateTime<Utc>,
    stale: bool,
  ) {
    let hash = key.cache_hash();
    Self::detach(inner, &hash);

    let sensitive = value.contains_sensitive();
    let size = value.estimated_size();
    if sensitive {
      inner.sensitive_keys.insert(hash.clone());
    }
    inner.total_size += size;
    inner.entries.insert(
      hash,
      CacheEntry {
        key,
        value,
        updated_at,
        sensitive,
        stale,
        size,
      },
    );
  }

  fn detach(inner: &mut CacheInner, hash: &str) -> Option<CacheEntry> {
    let removed = inner.entries.remove(hash);
    if let Some(entry) = &removed {
      inner.total_size = inner.total_size.saturating_sub(entry.size);
      inner.sensitive_keys.remove(hash);
    }
    removed
  }

  /// One eviction pass: when over the pressure line, drop the oldest 25% of
  /// the non-sensitive entries. Sensitive entries are only ever removed by
  /// explicit invalidation or logout, so bounded memory never costs the user
  /// data they marked private.
  fn evict_if_pressured(&self, inner: &mut CacheInner) {
    let limit = (self.limits.max_size as f64 * self.limits.pressure_threshold) as usize;
    if inner.total_size <= limit {
      return;
    }

    let mut candidates: Vec<(String, DateTime<Utc>)> = inner
      .entries
      .iter()
      .filter(|(hash, _)| !inner.sensitive_keys.contains(*hash))
      .map(|(hash, entry)| (hash.clone(), entry.updated_at))
      .collect();

    if candidates.is_empty() {
      warn!(
        size = inner.total_size,
        limit, "cache over pressure limit but all entries are sensitive"
      );
      return;
    }

    candidates.sort_by_key(|(_, updated_at)| *updated_at);
    let evict_count = ((candidates.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);

    let mut freed = 0usize;
    for (hash, _) in candidates.into_iter().take(evict_count) {
      if let Some(entry) = Self::detach(inner, &hash) {
        freed += entry.size;
      }
    }
    debug!(
      evicted = evict_count,
      freed,
      remaining = inner.total_size,
      "cache eviction pass complete"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::records::test_support::{entry, page, sensitive_entry};
  use chrono::Duration;

  fn list_key(author: &str) -> QueryKey {
    QueryKey::Entries {
      author: author.into(),
      filter: Default::default(),
    }
  }

  fn single_key(author: &str, rkey: &str) -> QueryKey {
    QueryKey::Entry {
      author: author.into(),
      rkey: rkey.into(),
    }
  }

  #[test]
  fn tags_sensitive_entries_on_write() {
    let cache = RecordCache::new(CacheLimits::default());
    let key = list_key("alice");

    cache.set(
      key.clone(),
      CachedValue::Page(page(vec![entry("a", "x"), sensitive_entry("b", "y")])),
    );
    assert_eq!(cache.sensitive_count(), 1);

    // Overwriting with an all-public page untags the slot.
    cache.set(key, CachedValue::Page(page(vec![entry("a", "x")])));
    assert_eq!(cache.sensitive_count(), 0);
  }

  #[test]
  fn get_hands_out_clones() {
    let cache = RecordCache::new(CacheLimits::default());
    let key = list_key("alice");
    cache.set(key.clone(), CachedValue::Page(page(vec![entry("a", "x")])));

    let mut copy = cache.get(&key).unwrap();
    if let CachedValue::Page(p) = &mut copy.value {
      p.items.clear();
    }
    assert_eq!(cache.get_page(&key).unwrap().items.len(), 1);
  }

  #[test]
  fn update_page_is_read_modify_write() {
    let cache = RecordCache::new(CacheLimits::default());
    let key = list_key("alice");
    cache.set(key.clone(), CachedValue::Page(page(vec![entry("a", "x")])));

    let updated = cache.update_page(&key, |p| p.items.insert(0, entry("b", "y")));
    assert!(updated);
    let items = cache.get_page(&key).unwrap().items;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, "b");

    assert!(!cache.update_page(&single_key("alice", "a"), |_| {}));
  }

  #[test]
  fn eviction_spares_sensitive_entries() {
    // Tiny budget so two pages exceed the pressure line.
    let cache = RecordCache::new(CacheLimits {
      max_size: 1200,
      pressure_threshold: 0.5,
    });

    let old = Utc::now() - Duration::hours(5);
    let sensitive_key = list_key("alice");
    cache.restore(
      sensitive_key.clone(),
      CachedValue::Page(page(vec![sensitive_entry("s", &"x".repeat(200))])),
      old,
    );

    for i in 0..4 {
      cache.set(
        single_key("alice", &format!("r{}", i)),
        CachedValue::Single(entry(&format!("r{}", i), &"y".repeat(200))),
      );
    }

    // The sensitive page is the oldest slot yet survives every pass.
    assert!(cache.get(&sensitive_key).is_some());
    assert!(cache.len() < 5);
  }

  #[test]
  fn eviction_removes_oldest_quarter_of_candidates() {
    let cache = RecordCache::new(CacheLimits {
      max_size: 100,
      pressure_threshold: 0.1,
    });

    let base = Utc::now() - Duration::hours(10);
    for i in 0..7 {
      cache.restore(
        single_key("alice", &format!("r{}", i)),
        CachedValue::Single(entry(&format!("r{}", i), "body")),
        base + Duration::minutes(i),
      );
    }
    assert_eq!(cache.len(), 7);

    // The write trips a pass over 8 candidates: 2 go, oldest first.
    cache.set(
      single_key("alice", "r7"),
      CachedValue::Single(entry("r7", "body")),
    );
    assert!(cache.get(&single_key("alice", "r0")).is_none());
    assert!(cache.get(&single_key("alice", "r1")).is_none());
    assert!(cache.get(&single_key("alice", "r2")).is_some());
  }

  #[test]
  fn size_accounting_tracks_removals() {
    let cache = RecordCache::new(CacheLimits::default());
    let key = single_key("alice", "a");
    cache.set(key.clone(), CachedValue::Single(entry("a", "hello")));
    let size = cache.estimated_size();
    assert!(size > 0);

    cache.remove(&key);
    assert_eq!(cache.estimated_size(), 0);
    assert!(cache.is_empty());
  }

  #[test]
  fn superseded_fetch_results_are_discarded() {
    let cache = RecordCache::new(CacheLimits::default());
    let key = list_key("alice");

    let token = cache.begin_fetch(&key);
    cache.cancel_fetches(&key);

    let installed =
      cache.install_if_current(&key, token, CachedValue::Page(page(vec![entry("a", "x")])));
    assert!(!installed);
    assert!(cache.get(&key).is_none());

    // A fresh token installs normally.
    let token = cache.begin_fetch(&key);
    assert!(cache.install_if_current(&key, token, CachedValue::Page(page(vec![]))));
  }

  #[test]
  fn mark_stale_keeps_data_served() {
    let cache = RecordCache::new(CacheLimits::default());
    let key = list_key("alice");
    cache.set(key.clone(), CachedValue::Page(page(vec![entry("a", "x")])));

    assert!(cache.mark_stale(&key));
    let slot = cache.get(&key).unwrap();
    assert!(slot.stale);
    assert_eq!(slot.value.as_page().unwrap().items.len(), 1);

    assert!(!cache.mark_stale(&list_key("bob")));
  }
}
