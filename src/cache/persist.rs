//! Durable cache snapshots behind a minimal key-value capability.
//!
//! The snapshot is one serialized blob under a fixed storage key. Only
//! allow-listed query categories are persisted (never the live feed, never
//! pending optimistic entries), sensitive entries only pass through the
//! injected cipher — with no cipher configured they are simply not written —
//! and a snapshot older than 24 hours is discarded wholesale on restore
//! rather than partially trusted.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::key::QueryKey;
use super::store::{CachedValue, RecordCache};

/// Storage slot holding the serialized snapshot.
pub const STORAGE_KEY: &str = "jotline.cache.v1";

const SNAPSHOT_TTL_HOURS: i64 = 24;

/// Durable-storage failures. Kept separate from [`crate::error::ApiError`]:
/// persistence trouble never surfaces as a remote failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("storage backend error: {0}")]
  Backend(String),
  #[error("serialization error: {0}")]
  Codec(String),
  #[error("cipher error: {0}")]
  Cipher(String),
}

/// Minimal durable key-value capability, swappable per target platform.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
  fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
  fn remove(&self, key: &str) -> Result<(), StoreError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
    (**self).set(key, value)
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    (**self).remove(key)
  }
}

/// Encrypt/decrypt capability for sensitive entries. The algorithm lives with
/// the platform; the cache only decides *when* to call it.
pub trait EntryCipher: Send + Sync {
  fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError>;
  fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// In-memory store for tests and cache-less sessions.
#[derive(Default)]
pub struct MemoryStore {
  data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(self.data.lock().expect("store lock poisoned").get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
    self
      .data
      .lock()
      .expect("store lock poisoned")
      .insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    self.data.lock().expect("store lock poisoned").remove(key);
    Ok(())
  }
}

/// SQLite-backed store at the platform data directory.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Backend("could not determine data directory".into()))?;
    Self::open_at(&data_dir.join("jotline").join("cache.db"))
  }

  pub fn open_at(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StoreError::Backend(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Backend(format!("failed to open cache db at {}: {}", path.display(), e))
    })?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  #[cfg(test)]
  pub fn in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StoreError::Backend(format!("failed to open in-memory db: {}", e)))?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    self
      .lock()?
      .execute_batch(KV_SCHEMA)
      .map_err(|e| StoreError::Backend(format!("failed to run migrations: {}", e)))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Backend(format!("lock poisoned: {}", e)))
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT value FROM kv_store WHERE key = ?")
      .map_err(|e| StoreError::Backend(format!("failed to prepare query: {}", e)))?;

    let result = stmt.query_row(params![key], |row| row.get::<_, Vec<u8>>(0));
    match result {
      Ok(value) => Ok(Some(value)),
      Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
      Err(e) => Err(StoreError::Backend(format!("failed to read key: {}", e))),
    }
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, written_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| StoreError::Backend(format!("failed to write key: {}", e)))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    self
      .lock()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| StoreError::Backend(format!("failed to remove key: {}", e)))?;
    Ok(())
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQuery {
  key: QueryKey,
  /// JSON text of the cached value; hex-encoded ciphertext when `encrypted`
  data: String,
  updated_at: DateTime<Utc>,
  sensitive: bool,
  encrypted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSnapshot {
  queries: Vec<PersistedQuery>,
  timestamp: DateTime<Utc>,
}

/// Saves and restores cache snapshots through the capability traits.
pub struct CachePersistence {
  store: Box<dyn KeyValueStore>,
  cipher: Option<Arc<dyn EntryCipher>>,
}

impl CachePersistence {
  pub fn new(store: Box<dyn KeyValueStore>, cipher: Option<Arc<dyn EntryCipher>>) -> Self {
    Self { store, cipher }
  }

  /// Write the persistable slice of the cache. Returns how many entries were
  /// written.
  pub fn save(&self, cache: &RecordCache) -> Result<usize, StoreError> {
    let mut queries = Vec::new();

    for slot in cache.all_entries() {
      if !slot.key.persist_eligible() || slot.value.contains_pending() {
        continue;
      }

      let json = serde_json::to_vec(&slot.value)
        .map_err(|e| StoreError::Codec(format!("failed to serialize cache entry: {}", e)))?;

      let (data, encrypted) = if slot.sensitive {
        match &self.cipher {
          Some(cipher) => (hex::encode(cipher.encrypt(&json)?), true),
          None => {
            debug!(
              key = %slot.key.description(),
              "no cipher configured, sensitive entry not persisted"
            );
            continue;
          }
        }
      } else {
        let text = String::from_utf8(json)
          .map_err(|e| StoreError::Codec(format!("non-utf8 serialization: {}", e)))?;
        (text, false)
      };

      queries.push(PersistedQuery {
        key: slot.key,
        data,
        updated_at: slot.updated_at,
        sensitive: slot.sensitive,
        encrypted,
      });
    }

    let count = queries.len();
    let snapshot = PersistedSnapshot {
      queries,
      timestamp: Utc::now(),
    };
    let blob = serde_json::to_vec(&snapshot)
      .map_err(|e| StoreError::Codec(format!("failed to serialize snapshot: {}", e)))?;
    self.store.set(STORAGE_KEY, &blob)?;

    debug!(entries = count, "cache snapshot written");
    Ok(count)
  }

  /// Load the snapshot back into the cache. Returns how many entries were
  /// restored. A snapshot past its TTL, or one that fails to parse, is
  /// discarded wholesale.
  pub fn restore(&self, cache: &RecordCache) -> Result<usize, StoreError> {
    let Some(blob) = self.store.get(STORAGE_KEY)? else {
      return Ok(0);
    };

    let snapshot: PersistedSnapshot = match serde_json::from_slice(&blob) {
      Ok(snapshot) => snapshot,
      Err(e) => {
        warn!("discarding unreadable cache snapshot: {}", e);
        self.store.remove(STORAGE_KEY)?;
        return Ok(0);
      }
    };

    if Utc::now() - snapshot.timestamp > Duration::hours(SNAPSHOT_TTL_HOURS) {
      debug!("cache snapshot past its ttl, discarding");
      self.store.remove(STORAGE_KEY)?;
      return Ok(0);
    }

    let mut restored = 0;
    for query in snapshot.queries {
      let bytes = if query.encrypted {
        let Some(cipher) = &self.cipher else {
          continue;
        };
        let Ok(ciphertext) = hex::decode(&query.data) else {
          warn!(key = %query.key.description(), "bad ciphertext encoding, entry skipped");
          continue;
        };
        match cipher.decrypt(&ciphertext) {
          Ok(bytes) => bytes,
          Err(e) => {
            warn!(key = %query.key.description(), "decryption failed, entry skipped: {}", e);
            continue;
          }
        }
      } else {
        query.data.into_bytes()
      };

      match serde_json::from_slice::<CachedValue>(&bytes) {
        Ok(value) => {
          cache.restore(query.key, value, query.updated_at);
          restored += 1;
        }
        Err(e) => {
          warn!(key = %query.key.description(), "unreadable entry skipped: {}", e);
        }
      }
    }

    debug!(entries = restored, "cache snapshot restored");
    Ok(restored)
  }

  /// Drop the durable snapshot, e.g. on logout.
  pub fn wipe(&self) -> Result<(), StoreError> {
    self.store.remove(STORAGE_KEY)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::CacheLimits;
  use crate::records::test_support::{entry, page, sensitive_entry};
  use crate::records::{Entry, Payload, Privacy};

  /// Involutive test cipher; enough to prove plaintext never hits the store.
  struct FlipCipher;

  impl EntryCipher for FlipCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
      Ok(plaintext.iter().map(|b| b ^ 0xAA).collect())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
      self.encrypt(ciphertext)
    }
  }

  fn list_key(author: &str) -> QueryKey {
    QueryKey::Entries {
      author: author.into(),
      filter: Default::default(),
    }
  }

  fn cache_with_public_list() -> RecordCache {
    let cache = RecordCache::new(CacheLimits::default());
    cache.set(
      list_key("alice"),
      CachedValue::Page(page(vec![entry("a", "one"), entry("b", "two")])),
    );
    cache
  }

  #[test]
  fn roundtrip_restores_entries_with_their_timestamps() {
    let cache = cache_with_public_list();
    let before = cache.get(&list_key("alice")).unwrap();

    let persistence = CachePersistence::new(Box::new(MemoryStore::new()), None);
    assert_eq!(persistence.save(&cache).unwrap(), 1);

    let fresh = RecordCache::new(CacheLimits::default());
    assert_eq!(persistence.restore(&fresh).unwrap(), 1);

    let restored = fresh.get(&list_key("alice")).unwrap();
    assert_eq!(restored.value, before.value);
    assert_eq!(restored.updated_at, before.updated_at);
  }

  #[test]
  fn sensitive_entries_need_a_cipher_to_persist() {
    let cache = RecordCache::new(CacheLimits::default());
    cache.set(
      list_key("alice"),
      CachedValue::Page(page(vec![sensitive_entry("s", "secret")])),
    );

    let persistence = CachePersistence::new(Box::new(MemoryStore::new()), None);
    assert_eq!(persistence.save(&cache).unwrap(), 0);
  }

  #[test]
  fn sensitive_entries_are_encrypted_at_rest() {
    let cache = RecordCache::new(CacheLimits::default());
    cache.set(
      list_key("alice"),
      CachedValue::Page(page(vec![sensitive_entry("s", "the secret text")])),
    );

    let store = Arc::new(MemoryStore::new());
    let persistence = CachePersistence::new(Box::new(store.clone()), Some(Arc::new(FlipCipher)));
    assert_eq!(persistence.save(&cache).unwrap(), 1);

    // The blob on disk never contains the plaintext.
    let blob = store.get(STORAGE_KEY).unwrap().unwrap();
    let text = String::from_utf8_lossy(&blob);
    assert!(!text.contains("the secret text"));

    let fresh = RecordCache::new(CacheLimits::default());
    assert_eq!(persistence.restore(&fresh).unwrap(), 1);
    let restored = fresh.get_page(&list_key("alice")).unwrap();
    assert_eq!(restored.items[0].payload.text(), "the secret text");
  }

  #[test]
  fn pending_and_feed_entries_are_not_persisted() {
    let cache = cache_with_public_list();
    cache.set(
      QueryKey::Feed {
        author: "alice".into(),
      },
      CachedValue::Page(page(vec![entry("a", "one")])),
    );
    cache.set(
      QueryKey::Entry {
        author: "alice".into(),
        rkey: "temp-1".into(),
      },
      CachedValue::Single(Entry::optimistic(
        "temp-1".into(),
        Privacy::Public,
        Payload::Note { text: "wip".into() },
      )),
    );

    let persistence = CachePersistence::new(Box::new(MemoryStore::new()), None);
    // Only the plain listing qualifies.
    assert_eq!(persistence.save(&cache).unwrap(), 1);
  }

  #[test]
  fn expired_snapshot_is_discarded_wholesale() {
    let store = MemoryStore::new();
    let stale = PersistedSnapshot {
      queries: vec![PersistedQuery {
        key: list_key("alice"),
        data: serde_json::to_string(&CachedValue::Page(page(vec![entry("a", "one")]))).unwrap(),
        updated_at: Utc::now(),
        sensitive: false,
        encrypted: false,
      }],
      timestamp: Utc::now() - Duration::hours(25),
    };
    store
      .set(STORAGE_KEY, &serde_json::to_vec(&stale).unwrap())
      .unwrap();

    let persistence = CachePersistence::new(Box::new(store), None);
    let cache = RecordCache::new(CacheLimits::default());
    assert_eq!(persistence.restore(&cache).unwrap(), 0);
    assert!(cache.is_empty());
  }

  #[test]
  fn unreadable_snapshot_is_discarded() {
    let store = MemoryStore::new();
    store.set(STORAGE_KEY, b"not json at all").unwrap();

    let persistence = CachePersistence::new(Box::new(store), None);
    let cache = RecordCache::new(CacheLimits::default());
    assert_eq!(persistence.restore(&cache).unwrap(), 0);
  }

  #[test]
  fn sqlite_store_roundtrip() {
    let store = SqliteStore::in_memory().unwrap();
    assert!(store.get("missing").unwrap().is_none());

    store.set("k", b"v1").unwrap();
    assert_eq!(store.get("k").unwrap().unwrap(), b"v1");

    store.set("k", b"v2").unwrap();
    assert_eq!(store.get("k").unwrap().unwrap(), b"v2");

    store.remove("k").unwrap();
    assert!(store.get("k").unwrap().is_none());
  }
}
