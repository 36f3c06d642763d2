//! Property aggregation, the running, listing-level summary of every current
//! prediction for a listing.
//!
//! The aggregate stores enough running state (means with counts, histogram
//! entries with recency keys, a bounded feature table) to absorb one more
//! prediction in O(1) without re-reading history. [`PropertyAggregation::rebuild`]
//! replays a full record set through the same fold, so an incremental and a
//! rebuilt aggregate agree.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::prediction::PredictionRecord;

/// Bump on any change to the fold or the derived summaries. Aggregates with
/// an older version must be rebuilt rather than updated incrementally.
pub const CALCULATION_VERSION: u32 = 1;

/// Histogram bucket for predictions without a room-type label.
pub const UNKNOWN_ROOM: &str = "unknown";

// ─── Running mean ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
  pub mean:  f64,
  pub count: u64,
}

impl RunningMean {
  pub fn push(&mut self, x: f64) {
    self.count += 1;
    self.mean += (x - self.mean) / self.count as f64;
  }

  pub fn value(&self) -> Option<f64> { (self.count > 0).then_some(self.mean) }
}

// ─── Histograms ──────────────────────────────────────────────────────────────

/// A count plus the ordering key of the most recent contributing prediction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
  pub count:         u64,
  pub last_seen:     DateTime<Utc>,
  pub last_sequence: i64,
}

impl CategoryCount {
  fn new(at: (DateTime<Utc>, i64)) -> Self {
    Self { count: 1, last_seen: at.0, last_sequence: at.1 }
  }

  fn bump(&mut self, at: (DateTime<Utc>, i64)) {
    self.count += 1;
    if at > self.recency() {
      self.last_seen = at.0;
      self.last_sequence = at.1;
    }
  }

  fn recency(&self) -> (DateTime<Utc>, i64) { (self.last_seen, self.last_sequence) }

  /// Rank key: higher count wins, then the most recent observation.
  fn rank(&self) -> (u64, DateTime<Utc>, i64) {
    (self.count, self.last_seen, self.last_sequence)
  }
}

/// Counts per categorical label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Histogram {
  entries: BTreeMap<String, CategoryCount>,
}

impl Histogram {
  pub fn observe(&mut self, label: &str, at: (DateTime<Utc>, i64)) {
    match self.entries.get_mut(label) {
      Some(entry) => entry.bump(at),
      None => {
        self.entries.insert(label.to_owned(), CategoryCount::new(at));
      }
    }
  }

  pub fn total(&self) -> u64 { self.entries.values().map(|e| e.count).sum() }

  pub fn count(&self, label: &str) -> u64 {
    self.entries.get(label).map_or(0, |e| e.count)
  }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn counts(&self) -> BTreeMap<String, u64> {
    self
      .entries
      .iter()
      .map(|(k, v)| (k.clone(), v.count))
      .collect()
  }

  /// Highest count; ties go to the label seen most recently.
  pub fn dominant(&self) -> Option<&str> {
    self
      .entries
      .iter()
      .max_by_key(|(_, e)| e.rank())
      .map(|(k, _)| k.as_str())
  }

  /// Each label's share of the total.
  pub fn distribution(&self) -> BTreeMap<String, f64> {
    let total = self.total();
    if total == 0 {
      return BTreeMap::new();
    }
    self
      .entries
      .iter()
      .map(|(k, v)| (k.clone(), v.count as f64 / total as f64))
      .collect()
  }
}

// ─── Feature table ───────────────────────────────────────────────────────────

/// Bounded frequency table of feature tags.
///
/// When full, admitting an unseen tag evicts the least frequent entry; among
/// equally frequent entries the least recently seen one goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
  capacity: usize,
  entries:  BTreeMap<String, CategoryCount>,
}

impl FeatureTable {
  pub fn with_capacity(capacity: usize) -> Self {
    Self { capacity: capacity.max(1), entries: BTreeMap::new() }
  }

  pub fn capacity(&self) -> usize { self.capacity }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn count(&self, tag: &str) -> u64 {
    self.entries.get(tag).map_or(0, |e| e.count)
  }

  pub fn observe(&mut self, tag: &str, at: (DateTime<Utc>, i64)) {
    if let Some(entry) = self.entries.get_mut(tag) {
      entry.bump(at);
      return;
    }
    if self.entries.len() >= self.capacity {
      let victim = self
        .entries
        .iter()
        .min_by_key(|(_, e)| e.rank())
        .map(|(k, _)| k.clone());
      if let Some(victim) = victim {
        self.entries.remove(&victim);
      }
    }
    self.entries.insert(tag.to_owned(), CategoryCount::new(at));
  }

  /// The `n` most frequent tags, most frequent first.
  pub fn top(&self, n: usize) -> Vec<(String, u64)> {
    let mut ranked: Vec<_> = self.entries.iter().collect();
    ranked.sort_by(|a, b| b.1.rank().cmp(&a.1.rank()).then_with(|| a.0.cmp(b.0)));
    ranked
      .into_iter()
      .take(n)
      .map(|(k, v)| (k.clone(), v.count))
      .collect()
  }
}

// ─── PropertyAggregation ─────────────────────────────────────────────────────

/// One per listing. Mutated only by the aggregator; replaced wholesale on
/// rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyAggregation {
  pub listing_id:          Uuid,
  pub condition:           RunningMean,
  pub natural_light:       RunningMean,
  pub room_types:          Histogram,
  pub styles:              Histogram,
  pub localizations:       Histogram,
  pub features:            FeatureTable,
  pub total_images:        u64,
  pub last_calculated_at:  DateTime<Utc>,
  pub calculation_version: u32,
  /// Optimistic-concurrency counter; incremented on every committed change.
  pub revision:            u64,
}

impl PropertyAggregation {
  pub fn empty(
    listing_id: Uuid,
    feature_capacity: usize,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      listing_id,
      condition: RunningMean::default(),
      natural_light: RunningMean::default(),
      room_types: Histogram::default(),
      styles: Histogram::default(),
      localizations: Histogram::default(),
      features: FeatureTable::with_capacity(feature_capacity),
      total_images: 0,
      last_calculated_at: now,
      calculation_version: CALCULATION_VERSION,
      revision: 0,
    }
  }

  /// Absorb one prediction. The caller guarantees each record is folded at
  /// most once; a repeated fold double-counts.
  pub fn fold(&mut self, record: &PredictionRecord, now: DateTime<Utc>) {
    let at = record.order_key();
    let o = &record.outputs;

    if let Some(v) = o.condition_score {
      self.condition.push(v);
    }
    if let Some(v) = o.natural_light_score {
      self.natural_light.push(v);
    }

    self.room_types.observe(record.room_type().unwrap_or(UNKNOWN_ROOM), at);
    if let Some(style) = &o.style {
      self.styles.observe(&style.label, at);
    }
    if let Some(loc) = &o.localization {
      self.localizations.observe(&loc.label, at);
    }
    if let Some(tags) = &o.feature_tags {
      for tag in tags {
        self.features.observe(tag, at);
      }
    }

    self.total_images += 1;
    self.last_calculated_at = now;
  }

  /// Fold `records` into a fresh aggregate in ingestion-sequence order.
  pub fn rebuild(
    listing_id: Uuid,
    feature_capacity: usize,
    records: &[PredictionRecord],
    now: DateTime<Utc>,
  ) -> Self {
    let mut ordered: Vec<&PredictionRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.sequence);

    let mut agg = Self::empty(listing_id, feature_capacity, now);
    for record in ordered {
      agg.fold(record, now);
    }
    agg
  }

  /// `false` if the aggregate was computed by an older fold.
  pub fn is_current(&self) -> bool {
    self.calculation_version == CALCULATION_VERSION
  }

  pub fn overall_condition_score(&self) -> Option<f64> { self.condition.value() }

  pub fn avg_natural_light_score(&self) -> Option<f64> {
    self.natural_light.value()
  }

  pub fn room_counts(&self) -> BTreeMap<String, u64> { self.room_types.counts() }

  pub fn dominant_room_type(&self) -> Option<&str> { self.room_types.dominant() }

  pub fn common_features(&self, n: usize) -> Vec<String> {
    self.features.top(n).into_iter().map(|(tag, _)| tag).collect()
  }

  pub fn dominant_style(&self) -> Option<&str> { self.styles.dominant() }

  pub fn style_distribution(&self) -> BTreeMap<String, f64> {
    self.styles.distribution()
  }

  pub fn primary_localization(&self) -> Option<&str> {
    self.localizations.dominant()
  }

  pub fn localization_distribution(&self) -> BTreeMap<String, f64> {
    self.localizations.distribution()
  }
}
