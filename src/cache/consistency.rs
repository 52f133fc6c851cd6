//! Self-healing consistency pass over cached listings.
//!
//! The pass is advisory: it repairs what it can, logs what it removes, and
//! never surfaces an error to the caller. Malformed cache data gets no
//! partial trust — a page holding one bad record is dropped wholesale.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::key::QueryKey;
use super::store::RecordCache;
use crate::records::StatsSummary;

/// Aggregate drift allowed before the cached stats entry is invalidated,
/// as a fraction of the recomputed total. Counts are integers, so a
/// minimum slack of one keeps tiny lists from invalidating on every pass.
const AGGREGATE_TOLERANCE: f64 = 0.05;

/// What a validation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
  pub pages_scanned: usize,
  /// Page entries removed for structural corruption
  pub pages_removed: usize,
  /// Duplicate record occurrences stripped from pages
  pub duplicates_removed: usize,
  /// Whether the aggregate entry was invalidated for drifting
  pub aggregate_invalidated: bool,
}

pub struct ConsistencyValidator {
  cache: Arc<RecordCache>,
}

impl ConsistencyValidator {
  pub fn new(cache: Arc<RecordCache>) -> Self {
    Self { cache }
  }

  /// Scan and repair every cached listing belonging to `author`.
  pub fn validate_author(&self, author: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    self.structural_pass(author, &mut report);
    self.duplicate_pass(author, &mut report);
    self.aggregate_pass(author, &mut report);

    if report != ValidationReport::default() {
      debug!(
        author,
        scanned = report.pages_scanned,
        removed = report.pages_removed,
        duplicates = report.duplicates_removed,
        aggregate = report.aggregate_invalidated,
        "consistency pass finished"
      );
    }
    report
  }

  /// Phase 1: drop structurally corrupt page entries wholesale.
  fn structural_pass(&self, author: &str, report: &mut ValidationReport) {
    for key in self.cache.page_keys_for_author(author) {
      let Some(page) = self.cache.get_page(&key) else {
        continue;
      };
      report.pages_scanned += 1;

      let problem = if !page.coherent() {
        Some("cursor and has_more disagree".to_string())
      } else {
        page.items.iter().find_map(|entry| entry.validate().err())
      };

      if let Some(problem) = problem {
        warn!(
          key = %key.description(),
          problem,
          "removing corrupt page entry from cache"
        );
        self.cache.remove(&key);
        report.pages_removed += 1;
      }
    }
  }

  /// Phase 2: a record identity may appear in many listings but only once
  /// system-wide per listing set; keep the newest occurrence and strip the
  /// rest.
  fn duplicate_pass(&self, author: &str, report: &mut ValidationReport) {
    // identity -> (best created_at/revision seen, occurrences per page key)
    let mut occurrences: HashMap<String, Vec<(QueryKey, chrono::DateTime<chrono::Utc>, String)>> =
      HashMap::new();

    for key in self.cache.page_keys_for_author(author) {
      let Some(page) = self.cache.get_page(&key) else {
        continue;
      };
      for entry in &page.items {
        occurrences.entry(entry.id.clone()).or_default().push((
          key.clone(),
          entry.created_at,
          entry.revision.clone(),
        ));
      }
    }

    for (id, mut seen) in occurrences {
      if seen.len() < 2 {
        continue;
      }
      seen.sort_by(|a, b| (a.1, &a.2).cmp(&(b.1, &b.2)));
      let (keeper_key, keeper_created, _) = seen.last().cloned().expect("non-empty");
      let keeper_hash = keeper_key.cache_hash();

      for key in self.cache.page_keys_for_author(author) {
        let is_keeper_page = key.cache_hash() == keeper_hash;
        let removed_here = std::cell::Cell::new(0usize);
        self.cache.update_page(&key, |page| {
          let before = page.items.len();
          let mut kept = false;
          page.items.retain(|entry| {
            if entry.id != id {
              return true;
            }
            if is_keeper_page && !kept && entry.created_at == keeper_created {
              kept = true;
              return true;
            }
            false
          });
          removed_here.set(before - page.items.len());
        });
        report.duplicates_removed += removed_here.get();
      }
      debug!(author, id, "duplicate record repaired");
    }
  }

  /// Phase 3: cross-check the cached aggregate against a recomputation from
  /// the reference listing; on drift beyond tolerance, invalidate the
  /// aggregate so it gets recomputed, never patch it in place.
  fn aggregate_pass(&self, author: &str, report: &mut ValidationReport) {
    let reference_key = QueryKey::Entries {
      author: author.into(),
      filter: Default::default(),
    };
    let stats_key = QueryKey::Stats {
      author: author.into(),
    };

    let Some(reference) = self.cache.get_page(&reference_key) else {
      return;
    };
    let Some(cached) = self
      .cache
      .get(&stats_key)
      .and_then(|entry| entry.value.as_stats().cloned())
    else {
      return;
    };

    let actual = StatsSummary::from_entries(&reference.items);
    let slack = ((actual.total as f64 * AGGREGATE_TOLERANCE).round() as usize).max(1);

    let mut drifted = usize::abs_diff(cached.total, actual.total) > slack
      || usize::abs_diff(cached.sensitive, actual.sensitive) > slack;
    if !drifted {
      for (kind, count) in &actual.by_kind {
        let cached_count = cached.by_kind.get(kind).copied().unwrap_or(0);
        if usize::abs_diff(cached_count, *count) > slack {
          drifted = true;
          break;
        }
      }
    }

    if drifted {
      warn!(
        author,
        cached_total = cached.total,
        actual_total = actual.total,
        "aggregate drifted beyond tolerance, invalidating"
      );
      self.cache.mark_stale(&stats_key);
      report.aggregate_invalidated = true;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::{CacheLimits, CachedValue};
  use crate::records::test_support::{entry, page, sensitive_entry};
  use chrono::Duration;

  fn list_key(author: &str) -> QueryKey {
    QueryKey::Entries {
      author: author.into(),
      filter: Default::default(),
    }
  }

  fn setup() -> (Arc<RecordCache>, ConsistencyValidator) {
    let cache = Arc::new(RecordCache::new(CacheLimits::default()));
    let validator = ConsistencyValidator::new(cache.clone());
    (cache, validator)
  }

  #[test]
  fn corrupt_page_is_removed_wholesale() {
    let (cache, validator) = setup();

    let mut bad = entry("bad", "body");
    bad.id.clear();
    cache.set(
      list_key("alice"),
      CachedValue::Page(page(vec![entry("ok", "body"), bad])),
    );
    cache.set(
      QueryKey::Feed {
        author: "alice".into(),
      },
      CachedValue::Page(page(vec![entry("ok", "body")])),
    );

    let report = validator.validate_author("alice");
    assert_eq!(report.pages_removed, 1);
    assert!(cache.get(&list_key("alice")).is_none());
    // The healthy page is untouched.
    assert!(cache
      .get(&QueryKey::Feed {
        author: "alice".into()
      })
      .is_some());
  }

  #[test]
  fn incoherent_pagination_is_corruption() {
    let (cache, validator) = setup();

    let mut p = page(vec![entry("a", "x")]);
    p.cursor = Some("next".into());
    p.has_more = false;
    cache.set(list_key("alice"), CachedValue::Page(p));

    let report = validator.validate_author("alice");
    assert_eq!(report.pages_removed, 1);
  }

  #[test]
  fn duplicate_repair_keeps_newest_occurrence() {
    let (cache, validator) = setup();

    let older = entry("x", "old body");
    let mut newer = entry("x", "new body");
    newer.created_at = older.created_at + Duration::hours(1);

    cache.set(list_key("alice"), CachedValue::Page(page(vec![older])));
    cache.set(
      QueryKey::Feed {
        author: "alice".into(),
      },
      CachedValue::Page(page(vec![newer.clone(), entry("y", "other")])),
    );

    let report = validator.validate_author("alice");
    assert_eq!(report.duplicates_removed, 1);

    let survivors: Vec<_> = cache
      .page_keys_for_author("alice")
      .iter()
      .filter_map(|k| cache.get_page(k))
      .flat_map(|p| p.items)
      .filter(|e| e.id == "x")
      .collect();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].created_at, newer.created_at);
  }

  #[test]
  fn aggregate_drift_invalidates_stats() {
    let (cache, validator) = setup();

    cache.set(
      list_key("alice"),
      CachedValue::Page(page(vec![
        entry("a", "one"),
        entry("b", "two"),
        sensitive_entry("c", "three"),
      ])),
    );
    cache.set(
      QueryKey::Stats {
        author: "alice".into(),
      },
      CachedValue::Stats(StatsSummary {
        total: 9,
        ..Default::default()
      }),
    );

    let report = validator.validate_author("alice");
    assert!(report.aggregate_invalidated);
    assert!(cache
      .get(&QueryKey::Stats {
        author: "alice".into()
      })
      .unwrap()
      .stale);
  }

  #[test]
  fn aggregate_within_tolerance_is_left_alone() {
    let (cache, validator) = setup();

    let items = vec![entry("a", "one"), entry("b", "two")];
    let mut stats = StatsSummary::from_entries(&items);
    stats.total += 1; // off by one, inside the minimum slack
    cache.set(list_key("alice"), CachedValue::Page(page(items)));
    cache.set(
      QueryKey::Stats {
        author: "alice".into(),
      },
      CachedValue::Stats(stats),
    );

    let report = validator.validate_author("alice");
    assert!(!report.aggregate_invalidated);
  }

  #[test]
  fn pass_on_empty_cache_is_a_noop() {
    let (_, validator) = setup();
    assert_eq!(validator.validate_author("alice"), ValidationReport::default());
  }
}
