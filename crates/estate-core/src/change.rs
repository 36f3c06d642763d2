//! Temporal change events: classified differences between two
//! chronologically ordered predictions of the same listing (and room).
//!
//! Events are append-only. [`compare`] is the pure comparison; locating the
//! baseline record and persisting the result are the engine's job.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::prediction::{MetricField, MetricValue, PredictionRecord};

// ─── Classification ──────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeType {
  Condition,
  Light,
  FeatureSet,
  Style,
}

impl ChangeType {
  pub const ALL: [Self; 4] =
    [Self::Condition, Self::Light, Self::FeatureSet, Self::Style];

  pub fn field(self) -> MetricField {
    match self {
      Self::Condition => MetricField::Condition,
      Self::Light => MetricField::NaturalLight,
      Self::FeatureSet => MetricField::Features,
      Self::Style => MetricField::Style,
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeDirection {
  Improved,
  Degraded,
  Stable,
}

/// Whether gaining a feature tag is good news for the property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagPolarity {
  /// Gaining it is an improvement, e.g. `renovated_kitchen`.
  Positive,
  /// Gaining it is a degradation, e.g. `mold`, `water_damage`.
  Negative,
  #[default]
  Neutral,
}

impl TagPolarity {
  fn weight(self) -> i32 {
    match self {
      Self::Positive => 1,
      Self::Negative => -1,
      Self::Neutral => 0,
    }
  }
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Comparison and flagging policy. Deserialisable so it can live in the
/// engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangePolicy {
  /// Differences at or below this are inference jitter, not change.
  pub noise_floor:           f64,
  pub condition_threshold:   f64,
  pub light_threshold:       f64,
  /// Applied to `|added ∪ removed| / |union|`.
  pub feature_set_threshold: f64,
  pub flag_style_changes:    bool,
  /// Also emit unflagged `stable` events when nothing moved.
  pub emit_stable_events:    bool,
  /// Only compare against prior images with the same room type.
  pub match_room_type:       bool,
  /// Tags not listed here are neutral.
  pub tag_polarity:          HashMap<String, TagPolarity>,
}

impl Default for ChangePolicy {
  fn default() -> Self {
    Self {
      noise_floor:           0.05,
      condition_threshold:   0.20,
      light_threshold:       0.25,
      feature_set_threshold: 0.50,
      flag_style_changes:    false,
      emit_stable_events:    false,
      match_room_type:       true,
      tag_polarity:          HashMap::new(),
    }
  }
}

impl ChangePolicy {
  pub fn polarity(&self, tag: &str) -> TagPolarity {
    self.tag_polarity.get(tag).copied().unwrap_or_default()
  }

  fn threshold(&self, kind: ChangeType) -> Option<f64> {
    match kind {
      ChangeType::Condition => Some(self.condition_threshold),
      ChangeType::Light => Some(self.light_threshold),
      ChangeType::FeatureSet => Some(self.feature_set_threshold),
      ChangeType::Style => None,
    }
  }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// What changed, shaped by the metric kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeDetail {
  Numeric { previous: f64, current: f64 },
  FeatureSet { added: Vec<String>, removed: Vec<String> },
  Category { previous: String, current: String },
}

/// An append-only record of one metric's change between two captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalChangeEvent {
  pub event_id:               Uuid,
  pub listing_id:             Uuid,
  pub current_image_id:       Uuid,
  pub current_prediction_id:  Uuid,
  /// Always a chronologically earlier capture of the same listing.
  pub previous_image_id:      Uuid,
  pub previous_prediction_id: Uuid,
  pub change_type:            ChangeType,
  pub direction:              ChangeDirection,
  /// Non-negative; `None` for categorical changes.
  pub magnitude:              Option<f64>,
  pub detail:                 ChangeDetail,
  pub time_delta_secs:        i64,
  pub detected_at:            DateTime<Utc>,
  pub model_version:          String,
  pub flagged_for_review:     bool,
}

impl TemporalChangeEvent {
  /// Magnitude signed by direction: positive when improved, negative when
  /// degraded.
  pub fn signed_magnitude(&self) -> Option<f64> {
    self.magnitude.map(|m| match self.direction {
      ChangeDirection::Degraded => -m,
      ChangeDirection::Improved | ChangeDirection::Stable => m,
    })
  }
}

// ─── Comparison ──────────────────────────────────────────────────────────────

/// Compare `current` against its chronological predecessor `previous`.
///
/// Metrics missing from either record are skipped.
pub fn compare(
  previous: &PredictionRecord,
  current: &PredictionRecord,
  policy: &ChangePolicy,
  detected_at: DateTime<Utc>,
) -> Vec<TemporalChangeEvent> {
  let delta = (current.captured_at - previous.captured_at).num_seconds();

  ChangeType::ALL
    .into_iter()
    .filter_map(|kind| {
      let field = kind.field();
      let (direction, magnitude, detail) =
        match (previous.metric(field)?, current.metric(field)?) {
          (MetricValue::Score(p), MetricValue::Score(c)) => {
            let (direction, magnitude) = numeric_change(p, c, policy.noise_floor);
            if direction == ChangeDirection::Stable && !policy.emit_stable_events {
              return None;
            }
            let detail = ChangeDetail::Numeric { previous: p, current: c };
            (direction, Some(magnitude), detail)
          }
          (MetricValue::TagSet(p), MetricValue::TagSet(c)) => {
            let (direction, magnitude, detail) = feature_change(p, c, policy);
            let unchanged = matches!(
              &detail,
              ChangeDetail::FeatureSet { added, removed }
                if added.is_empty() && removed.is_empty()
            );
            if unchanged && !policy.emit_stable_events {
              return None;
            }
            (direction, Some(magnitude), detail)
          }
          (MetricValue::Category(p), MetricValue::Category(c)) => {
            if p.label == c.label {
              return None;
            }
            let detail = ChangeDetail::Category {
              previous: p.label.clone(),
              current:  c.label.clone(),
            };
            (ChangeDirection::Stable, None, detail)
          }
          _ => return None,
        };

      let flagged = should_flag(kind, direction, magnitude, &detail, policy);

      Some(TemporalChangeEvent {
        event_id: Uuid::new_v4(),
        listing_id: current.listing_id,
        current_image_id: current.image_id,
        current_prediction_id: current.prediction_id,
        previous_image_id: previous.image_id,
        previous_prediction_id: previous.prediction_id,
        change_type: kind,
        direction,
        magnitude,
        detail,
        time_delta_secs: delta,
        detected_at,
        model_version: current.model_version.clone(),
        flagged_for_review: flagged,
      })
    })
    .collect()
}

fn numeric_change(previous: f64, current: f64, eps: f64) -> (ChangeDirection, f64) {
  let direction = if current > previous + eps {
    ChangeDirection::Improved
  } else if current < previous - eps {
    ChangeDirection::Degraded
  } else {
    ChangeDirection::Stable
  };
  (direction, (current - previous).abs())
}

fn feature_change(
  previous: &BTreeSet<String>,
  current: &BTreeSet<String>,
  policy: &ChangePolicy,
) -> (ChangeDirection, f64, ChangeDetail) {
  let added: Vec<String> = current.difference(previous).cloned().collect();
  let removed: Vec<String> = previous.difference(current).cloned().collect();

  let union = previous.union(current).count();
  let magnitude = if union == 0 {
    0.0
  } else {
    (added.len() + removed.len()) as f64 / union as f64
  };

  let net: i32 = added.iter().map(|t| policy.polarity(t).weight()).sum::<i32>()
    - removed.iter().map(|t| policy.polarity(t).weight()).sum::<i32>();
  let direction = match net {
    n if n > 0 => ChangeDirection::Improved,
    n if n < 0 => ChangeDirection::Degraded,
    _ => ChangeDirection::Stable,
  };

  (direction, magnitude, ChangeDetail::FeatureSet { added, removed })
}

fn should_flag(
  kind: ChangeType,
  direction: ChangeDirection,
  magnitude: Option<f64>,
  detail: &ChangeDetail,
  policy: &ChangePolicy,
) -> bool {
  match kind {
    ChangeType::Style => policy.flag_style_changes,
    ChangeType::Condition if direction == ChangeDirection::Degraded => true,
    ChangeType::Condition | ChangeType::Light => {
      direction != ChangeDirection::Stable
        && over_threshold(kind, magnitude, policy)
    }
    ChangeType::FeatureSet => {
      let changed = matches!(
        detail,
        ChangeDetail::FeatureSet { added, removed }
          if !added.is_empty() || !removed.is_empty()
      );
      changed && over_threshold(kind, magnitude, policy)
    }
  }
}

fn over_threshold(
  kind: ChangeType,
  magnitude: Option<f64>,
  policy: &ChangePolicy,
) -> bool {
  match (magnitude, policy.threshold(kind)) {
    // A hair of tolerance so 0.75 - 0.40 meets a 0.35 threshold.
    (Some(m), Some(t)) => m + 1e-9 >= t,
    _ => false,
  }
}
