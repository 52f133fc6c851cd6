//! Journal record types shared by the cache, mutation, and API layers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest accepted entry body. The server enforces the same bound; checking
/// locally lets the validation pass drop corrupt cache data without a round
/// trip.
pub const MAX_TEXT_LEN: usize = 10_000;

/// Privacy level of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
  Public,
  Sensitive,
}

/// The closed set of entry kinds. Derived from the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
  Journal,
  Note,
  Milestone,
}

impl EntryKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Journal => "journal",
      Self::Note => "note",
      Self::Milestone => "milestone",
    }
  }
}

/// Structured entry content. One fixed schema per kind, so structural
/// validation is exhaustive matching rather than field probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
  Journal {
    text: String,
    mood: Option<String>,
  },
  Note {
    text: String,
  },
  Milestone {
    title: String,
    occurred_on: NaiveDate,
  },
}

impl Payload {
  pub fn kind(&self) -> EntryKind {
    match self {
      Self::Journal { .. } => EntryKind::Journal,
      Self::Note { .. } => EntryKind::Note,
      Self::Milestone { .. } => EntryKind::Milestone,
    }
  }

  /// The user-visible body text of this payload.
  pub fn text(&self) -> &str {
    match self {
      Self::Journal { text, .. } | Self::Note { text } => text,
      Self::Milestone { title, .. } => title,
    }
  }

  fn set_text(&mut self, new_text: String) {
    match self {
      Self::Journal { text, .. } | Self::Note { text } => *text = new_text,
      Self::Milestone { title, .. } => *title = new_text,
    }
  }
}

/// A single journal entry as held in the cache.
///
/// `id` is stable within an author's record set; `revision` is an opaque
/// version token that changes on every successful remote write. While a
/// mutation is in flight the entry carries a `temp-…` id and `pending: true`;
/// such entries are never written to durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
  pub id: String,
  /// Remote address of the record
  pub uri: String,
  pub revision: String,
  pub privacy: Privacy,
  pub created_at: DateTime<Utc>,
  pub payload: Payload,
  #[serde(default)]
  pub pending: bool,
}

impl Entry {
  /// Build the optimistic placeholder inserted ahead of a remote create.
  pub fn optimistic(temp_id: String, privacy: Privacy, payload: Payload) -> Self {
    Self {
      id: temp_id,
      uri: String::new(),
      revision: String::new(),
      privacy,
      created_at: Utc::now(),
      payload,
      pending: true,
    }
  }

  pub fn kind(&self) -> EntryKind {
    self.payload.kind()
  }

  /// Structural check used at the cache boundary. Fail-closed: a page holding
  /// an entry that fails this check is dropped wholesale.
  pub fn validate(&self) -> Result<(), String> {
    if self.id.is_empty() {
      return Err("entry id is empty".into());
    }
    if !self.pending && self.revision.is_empty() {
      return Err(format!("entry {} has no revision", self.id));
    }
    let text = self.payload.text();
    if text.is_empty() {
      return Err(format!("entry {} has empty content", self.id));
    }
    if text.len() > MAX_TEXT_LEN {
      return Err(format!(
        "entry {} content exceeds {} bytes",
        self.id, MAX_TEXT_LEN
      ));
    }
    Ok(())
  }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPage {
  pub items: Vec<Entry>,
  pub cursor: Option<String>,
  pub has_more: bool,
}

impl EntryPage {
  pub fn empty() -> Self {
    Self {
      items: Vec::new(),
      cursor: None,
      has_more: false,
    }
  }

  /// A page is coherent when its pagination fields agree.
  pub fn coherent(&self) -> bool {
    self.has_more == self.cursor.is_some()
  }
}

/// Partial update applied to an existing entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryPatch {
  pub text: Option<String>,
  pub privacy: Option<Privacy>,
}

impl EntryPatch {
  pub fn apply_to(&self, entry: &mut Entry) {
    if let Some(text) = &self.text {
      entry.payload.set_text(text.clone());
    }
    if let Some(privacy) = self.privacy {
      entry.privacy = privacy;
    }
  }
}

/// Aggregate counts over an author's entries, cached alongside the lists they
/// summarize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
  pub total: usize,
  pub by_kind: BTreeMap<EntryKind, usize>,
  pub sensitive: usize,
}

impl StatsSummary {
  /// Recompute the summary from a list of entries.
  pub fn from_entries(entries: &[Entry]) -> Self {
    let mut by_kind = BTreeMap::new();
    let mut sensitive = 0;
    for entry in entries {
      *by_kind.entry(entry.kind()).or_insert(0) += 1;
      if entry.privacy == Privacy::Sensitive {
        sensitive += 1;
      }
    }
    Self {
      total: entries.len(),
      by_kind,
      sensitive,
    }
  }
}
