//! Query keys identifying logical queries in the cache.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::records::{EntryKind, Privacy};

/// Filter criteria for entry listings.
///
/// Uses ordered containers so that equal filter sets produce identical cache
/// hashes no matter the order they were built in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
  /// Restrict to these kinds; empty means all kinds
  #[serde(default)]
  pub kinds: BTreeSet<EntryKind>,
  /// Restrict to one privacy level
  #[serde(default)]
  pub privacy: Option<Privacy>,
  /// Free-text search term
  #[serde(default)]
  pub search: Option<String>,
}

impl FilterSet {
  /// Whether an entry with the given kind/privacy belongs in a listing
  /// filtered by this set. Search terms are evaluated server-side only, so a
  /// filter with a search term never admits optimistic inserts.
  pub fn admits(&self, kind: EntryKind, privacy: Privacy) -> bool {
    if self.search.is_some() {
      return false;
    }
    if !self.kinds.is_empty() && !self.kinds.contains(&kind) {
      return false;
    }
    match self.privacy {
      Some(p) => p == privacy,
      None => true,
    }
  }

  fn canonical(&self) -> String {
    let kinds: Vec<&str> = self.kinds.iter().map(|k| k.as_str()).collect();
    format!(
      "kinds={};privacy={};search={}",
      kinds.join(","),
      match self.privacy {
        Some(Privacy::Public) => "public",
        Some(Privacy::Sensitive) => "sensitive",
        None => "",
      },
      self.search.as_deref().unwrap_or("").trim().to_lowercase(),
    )
  }
}

/// Identity of a logical query against the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKey {
  /// A single entry
  Entry { author: String, rkey: String },
  /// An entry listing for one author
  Entries { author: String, filter: FilterSet },
  /// Aggregate counts for one author
  Stats { author: String },
  /// The live activity feed for one author
  Feed { author: String },
}

impl QueryKey {
  pub fn author(&self) -> &str {
    match self {
      Self::Entry { author, .. }
      | Self::Entries { author, .. }
      | Self::Stats { author }
      | Self::Feed { author } => author,
    }
  }

  /// Whether this key holds a paginated listing.
  pub fn is_page(&self) -> bool {
    matches!(self, Self::Entries { .. } | Self::Feed { .. })
  }

  /// Query categories eligible for durable persistence. The live feed is
  /// excluded: it goes stale faster than any restore can be useful.
  pub fn persist_eligible(&self) -> bool {
    !matches!(self, Self::Feed { .. })
  }

  /// Stable, fixed-length cache key.
  pub fn cache_hash(&self) -> String {
    let input = match self {
      Self::Entry { author, rkey } => format!("entry:{}:{}", author, rkey),
      Self::Entries { author, filter } => {
        format!("entries:{}:{}", author, filter.canonical())
      }
      Self::Stats { author } => format!("stats:{}", author),
      Self::Feed { author } => format!("feed:{}", author),
    };

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human-readable label for logs.
  pub fn description(&self) -> String {
    match self {
      Self::Entry { author, rkey } => format!("entry {}/{}", author, rkey),
      Self::Entries { author, filter } => {
        if *filter == FilterSet::default() {
          format!("entries for {}", author)
        } else {
          format!("entries for {} ({})", author, filter.canonical())
        }
      }
      Self::Stats { author } => format!("stats for {}", author),
      Self::Feed { author } => format!("feed for {}", author),
    }
  }
}
