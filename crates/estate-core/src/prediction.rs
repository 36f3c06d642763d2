//! Prediction records: the structured output of the image model for one
//! image under one model version.
//!
//! A record is immutable once written. A later record for the same image
//! supersedes it; nothing is ever overwritten in place.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Maximum deviation of an embedding's L2 norm from 1.
pub const NORM_TOLERANCE: f64 = 1e-3;

// ─── Head outputs ────────────────────────────────────────────────────────────

/// A categorical head output: the winning label and the model's confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
  pub label:      String,
  pub confidence: f64,
}

impl LabelScore {
  pub fn new(label: impl Into<String>, confidence: f64) -> Self {
    Self { label: label.into(), confidence }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
  Low,
  Medium,
  High,
}

/// A suggested improvement, e.g. "repaint exterior".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecommendation {
  pub kind:          String,
  pub priority:      Priority,
  /// Estimated return on investment as a fraction (0.15 = 15 %).
  pub estimated_roi: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
  pub low:      f64,
  pub high:     f64,
  /// ISO 4217 code.
  pub currency: String,
}

// ─── Embeddings ──────────────────────────────────────────────────────────────

/// A fixed-dimension embedding vector. Stored vectors are unit-normalised so
/// cosine similarity reduces to a dot product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
  /// Wrap a vector as-is. Call [`ModelOutputs::validate`] before persisting.
  pub fn new(values: Vec<f32>) -> Self { Self(values) }

  /// Scale `values` to unit length.
  pub fn normalized(mut values: Vec<f32>) -> Result<Self> {
    let norm = l2_norm(&values);
    if norm == 0.0 || !norm.is_finite() {
      return Err(Error::validation("cannot normalise a zero-length embedding"));
    }
    for v in &mut values {
      *v = (f64::from(*v) / norm) as f32;
    }
    Ok(Self(values))
  }

  pub fn as_slice(&self) -> &[f32] { &self.0 }

  pub fn dim(&self) -> usize { self.0.len() }

  pub fn norm(&self) -> f64 { l2_norm(&self.0) }

  pub fn is_unit(&self) -> bool {
    !self.0.is_empty() && (self.norm() - 1.0).abs() <= NORM_TOLERANCE
  }

  /// Cosine similarity of two unit vectors. `None` if dimensions differ.
  pub fn cosine_similarity(&self, other: &Self) -> Option<f64> {
    if self.dim() != other.dim() {
      return None;
    }
    Some(
      self
        .0
        .iter()
        .zip(&other.0)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum(),
    )
  }
}

fn l2_norm(values: &[f32]) -> f64 {
  values
    .iter()
    .map(|v| f64::from(*v) * f64::from(*v))
    .sum::<f64>()
    .sqrt()
}

// ─── Model outputs ───────────────────────────────────────────────────────────

/// Everything the model produced for one image. Any head may be absent; the
/// downstream components skip absent metrics rather than failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOutputs {
  pub room_type:            Option<LabelScore>,
  /// Overall condition, 0 (derelict) to 1 (pristine).
  pub condition_score:      Option<f64>,
  pub natural_light_score:  Option<f64>,
  pub style:                Option<LabelScore>,
  pub localization:         Option<LabelScore>,
  /// `None` means the feature head did not run; an empty set means it ran
  /// and saw nothing.
  pub feature_tags:         Option<BTreeSet<String>>,
  pub work_recommendations: Vec<WorkRecommendation>,
  pub cost_estimates:       Vec<CostEstimate>,
  pub image_embedding:      Option<Embedding>,
  pub text_embedding:       Option<Embedding>,
}

impl ModelOutputs {
  /// Reject out-of-range scores, confidences, costs and non-unit embeddings.
  pub fn validate(&self) -> Result<()> {
    unit_interval("condition_score", self.condition_score)?;
    unit_interval("natural_light_score", self.natural_light_score)?;

    for (name, label) in [
      ("room_type", &self.room_type),
      ("style", &self.style),
      ("localization", &self.localization),
    ] {
      if let Some(l) = label {
        if l.label.trim().is_empty() {
          return Err(Error::validation(format!("{name} label is empty")));
        }
        unit_interval(&format!("{name} confidence"), Some(l.confidence))?;
      }
    }

    if let Some(tags) = &self.feature_tags
      && tags.iter().any(|t| t.trim().is_empty())
    {
      return Err(Error::validation("feature tags must not be empty strings"));
    }

    for rec in &self.work_recommendations {
      if let Some(roi) = rec.estimated_roi
        && !roi.is_finite()
      {
        return Err(Error::validation(format!(
          "recommendation {:?} has a non-finite ROI",
          rec.kind
        )));
      }
    }

    for cost in &self.cost_estimates {
      if !(cost.low.is_finite() && cost.high.is_finite()) || cost.low < 0.0 {
        return Err(Error::validation("cost bounds must be finite and non-negative"));
      }
      if cost.low > cost.high {
        return Err(Error::validation(format!(
          "cost estimate low bound {} exceeds high bound {}",
          cost.low, cost.high
        )));
      }
    }

    for (name, emb) in [
      ("image_embedding", &self.image_embedding),
      ("text_embedding", &self.text_embedding),
    ] {
      if let Some(e) = emb
        && !e.is_unit()
      {
        return Err(Error::validation(format!(
          "{name} is not unit-normalised (norm {:.6})",
          e.norm()
        )));
      }
    }

    Ok(())
  }
}

fn unit_interval(name: &str, value: Option<f64>) -> Result<()> {
  match value {
    Some(v) if !(0.0..=1.0).contains(&v) => Err(Error::validation(format!(
      "{name} must lie in [0, 1], got {v}"
    ))),
    _ => Ok(()),
  }
}

// ─── Tagged metric view ──────────────────────────────────────────────────────

/// The metric heads a record can be queried for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricField {
  Condition,
  NaturalLight,
  RoomType,
  Style,
  Localization,
  Features,
  Recommendations,
}

/// A borrowed view of one head's output, tagged by shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue<'a> {
  Score(f64),
  Category(&'a LabelScore),
  TagSet(&'a BTreeSet<String>),
  Recommendations(&'a [WorkRecommendation]),
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// An immutable, persisted prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
  pub prediction_id: Uuid,
  /// Store-assigned ingestion sequence; strictly increasing.
  pub sequence:      i64,
  pub image_id:      Uuid,
  pub listing_id:    Uuid,
  pub model_version: String,
  /// Capture (or, failing that, inference) time of the image.
  pub captured_at:   DateTime<Utc>,
  /// Server-assigned; never changes after creation.
  pub recorded_at:   DateTime<Utc>,
  pub outputs:       ModelOutputs,
}

impl PredictionRecord {
  /// Chronological ordering key. Identical capture times fall back to the
  /// ingestion sequence so ordering stays deterministic.
  pub fn order_key(&self) -> (DateTime<Utc>, i64) {
    (self.captured_at, self.sequence)
  }

  pub fn room_type(&self) -> Option<&str> {
    self.outputs.room_type.as_ref().map(|r| r.label.as_str())
  }

  pub fn metric(&self, field: MetricField) -> Option<MetricValue<'_>> {
    let o = &self.outputs;
    match field {
      MetricField::Condition => o.condition_score.map(MetricValue::Score),
      MetricField::NaturalLight => o.natural_light_score.map(MetricValue::Score),
      MetricField::RoomType => o.room_type.as_ref().map(MetricValue::Category),
      MetricField::Style => o.style.as_ref().map(MetricValue::Category),
      MetricField::Localization => {
        o.localization.as_ref().map(MetricValue::Category)
      }
      MetricField::Features => o.feature_tags.as_ref().map(MetricValue::TagSet),
      MetricField::Recommendations => Some(MetricValue::Recommendations(
        o.work_recommendations.as_slice(),
      )),
    }
  }
}

/// Input to [`crate::store::IntelligenceStore::record_prediction`].
/// `prediction_id`, `sequence` and `recorded_at` are set by the store.
#[derive(Debug, Clone)]
pub struct NewPrediction {
  pub image_id:      Uuid,
  pub listing_id:    Uuid,
  pub model_version: String,
  pub captured_at:   DateTime<Utc>,
  pub outputs:       ModelOutputs,
}

impl NewPrediction {
  pub fn new(
    listing_id: Uuid,
    image_id: Uuid,
    model_version: impl Into<String>,
    captured_at: DateTime<Utc>,
    outputs: ModelOutputs,
  ) -> Self {
    Self {
      image_id,
      listing_id,
      model_version: model_version.into(),
      captured_at,
      outputs,
    }
  }
}
