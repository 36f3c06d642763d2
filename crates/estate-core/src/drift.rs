//! Drift records and the statistics behind them.
//!
//! Every record is scored with the Kolmogorov–Smirnov statistic: two-sample
//! against an empirical baseline, one-sample against a normal baseline. The
//! test is stored on each record so scores from different tests are never
//! compared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use uuid::Uuid;

use crate::{Error, Result, prediction::PredictionRecord};

/// Condition score at or above which an image counts as "good condition".
pub const GOOD_CONDITION: f64 = 0.8;
/// Natural-light score at or above which an image counts as "well lit".
pub const GOOD_LIGHT: f64 = 0.6;

// ─── Metrics ─────────────────────────────────────────────────────────────────

/// The per-record scalar a drift evaluation tracks.
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
  strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DriftMetric {
  ConditionScore,
  NaturalLightScore,
  RoomTypeConfidence,
  StyleConfidence,
  /// 1 if condition ≥ [`GOOD_CONDITION`], else 0. The window mean is the
  /// fraction of good-condition images.
  ConditionGoodRatio,
  /// 1 if natural light ≥ [`GOOD_LIGHT`], else 0.
  NaturalLightGoodRatio,
}

impl DriftMetric {
  pub const ALL: [Self; 6] = [
    Self::ConditionScore,
    Self::NaturalLightScore,
    Self::RoomTypeConfidence,
    Self::StyleConfidence,
    Self::ConditionGoodRatio,
    Self::NaturalLightGoodRatio,
  ];

  pub fn parse(name: &str) -> Result<Self> {
    name.parse().map_err(|_| Error::UnknownMetric(name.to_owned()))
  }

  pub fn as_str(self) -> &'static str { self.into() }

  /// The scalar for one record, or `None` if the record lacks the metric.
  pub fn sample(self, record: &PredictionRecord) -> Option<f64> {
    let o = &record.outputs;
    let indicator = |hit: bool| if hit { 1.0 } else { 0.0 };
    match self {
      Self::ConditionScore => o.condition_score,
      Self::NaturalLightScore => o.natural_light_score,
      Self::RoomTypeConfidence => o.room_type.as_ref().map(|r| r.confidence),
      Self::StyleConfidence => o.style.as_ref().map(|s| s.confidence),
      Self::ConditionGoodRatio => {
        o.condition_score.map(|v| indicator(v >= GOOD_CONDITION))
      }
      Self::NaturalLightGoodRatio => {
        o.natural_light_score.map(|v| indicator(v >= GOOD_LIGHT))
      }
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
pub enum DriftTest {
  #[default]
  #[serde(rename = "ks")]
  #[strum(serialize = "ks")]
  KolmogorovSmirnov,
}

// ─── Windows and samples ─────────────────────────────────────────────────────

/// A half-open evaluation window `[start, end)` on capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftWindow {
  pub start: DateTime<Utc>,
  pub end:   DateTime<Utc>,
}

impl DriftWindow {
  pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
    if end <= start {
      return Err(Error::Validation(format!(
        "drift window end {end} is not after start {start}"
      )));
    }
    Ok(Self { start, end })
  }

  pub fn contains(&self, at: DateTime<Utc>) -> bool {
    at >= self.start && at < self.end
  }
}

/// Mean and population standard deviation of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
  pub mean: f64,
  pub std:  f64,
  pub n:    usize,
}

impl SampleStats {
  pub fn of(values: &[f64]) -> Option<Self> {
    if values.is_empty() {
      return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(Self { mean, std: var.sqrt(), n: values.len() })
  }
}

// ─── Baselines ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaselineDistribution {
  /// A parametric reference, e.g. from a validation run.
  Normal { mean: f64, std: f64 },
  /// A stored reference sample, sorted ascending.
  Empirical { values: Vec<f64> },
}

impl BaselineDistribution {
  pub fn empirical(mut values: Vec<f64>) -> Self {
    values.retain(|v| v.is_finite());
    values.sort_by(f64::total_cmp);
    Self::Empirical { values }
  }

  pub fn stats(&self) -> Option<SampleStats> {
    match self {
      Self::Normal { mean, std } => Some(SampleStats { mean: *mean, std: *std, n: 0 }),
      Self::Empirical { values } => SampleStats::of(values),
    }
  }
}

/// The reference distribution for one `(model_version, metric)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftBaseline {
  pub model_version: String,
  pub metric:        DriftMetric,
  pub distribution:  BaselineDistribution,
  pub captured_at:   DateTime<Utc>,
}

// ─── KS statistic ────────────────────────────────────────────────────────────

/// Kolmogorov–Smirnov distance between `sample` and `baseline`.
/// `None` when either side has no data.
pub fn ks_statistic(sample: &[f64], baseline: &BaselineDistribution) -> Option<f64> {
  let mut xs: Vec<f64> = sample.iter().copied().filter(|v| v.is_finite()).collect();
  if xs.is_empty() {
    return None;
  }
  xs.sort_by(f64::total_cmp);

  match baseline {
    BaselineDistribution::Normal { mean, std } => {
      Some(ks_one_sample(&xs, |x| normal_cdf(x, *mean, *std)))
    }
    BaselineDistribution::Empirical { values } if values.is_empty() => None,
    BaselineDistribution::Empirical { values } => Some(ks_two_sample(&xs, values)),
  }
}

fn normal_cdf(x: f64, mean: f64, std: f64) -> f64 {
  match Normal::new(mean, std) {
    Ok(dist) if std > 0.0 => dist.cdf(x),
    // Degenerate baseline: a point mass at the mean.
    _ => if x >= mean { 1.0 } else { 0.0 },
  }
}

fn ks_one_sample(sorted: &[f64], cdf: impl Fn(f64) -> f64) -> f64 {
  let n = sorted.len() as f64;
  sorted
    .iter()
    .enumerate()
    .map(|(i, &x)| {
      let f = cdf(x);
      let above = (i + 1) as f64 / n - f;
      let below = f - i as f64 / n;
      above.max(below)
    })
    .fold(0.0, f64::max)
}

fn ks_two_sample(a: &[f64], b: &[f64]) -> f64 {
  let (na, nb) = (a.len() as f64, b.len() as f64);
  let (mut i, mut j) = (0, 0);
  let mut d: f64 = 0.0;
  while i < a.len() && j < b.len() {
    let x = a[i].min(b[j]);
    while i < a.len() && a[i] <= x {
      i += 1;
    }
    while j < b.len() && b[j] <= x {
      j += 1;
    }
    d = d.max((i as f64 / na - j as f64 / nb).abs());
  }
  d
}

// ─── Records ─────────────────────────────────────────────────────────────────

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
pub enum DriftStatus {
  Stable,
  Drifted,
  /// The window held fewer samples than the configured minimum. Never alerts.
  InsufficientData,
}

/// One evaluation of `(model_version, metric)` over a window. Upserted on
/// that key, so re-evaluating a window replaces its figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftRecord {
  pub drift_id:        Uuid,
  pub model_version:   String,
  pub metric:          DriftMetric,
  pub drift_test:      DriftTest,
  pub baseline_mean:   Option<f64>,
  pub baseline_std:    Option<f64>,
  pub current_mean:    Option<f64>,
  pub current_std:     Option<f64>,
  pub drift_score:     Option<f64>,
  /// Effect size: `|current_mean - baseline_mean| / baseline_std`.
  pub drift_magnitude: Option<f64>,
  pub status:          DriftStatus,
  pub alert_sent:      bool,
  pub threshold:       f64,
  pub min_sample_size: u64,
  pub sample_size:     u64,
  pub window:          DriftWindow,
  pub evaluated_at:    DateTime<Utc>,
}

impl DriftRecord {
  pub fn drift_detected(&self) -> bool { self.status == DriftStatus::Drifted }

  pub fn alert_pending(&self) -> bool { self.drift_detected() && !self.alert_sent }
}

/// Thresholds applied by [`assess`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftCriteria {
  pub threshold:       f64,
  pub min_sample_size: u64,
}

/// Score `samples` against `baseline` and classify the window.
pub fn assess(
  baseline: &DriftBaseline,
  samples: &[f64],
  window: DriftWindow,
  criteria: DriftCriteria,
  evaluated_at: DateTime<Utc>,
) -> DriftRecord {
  let base = baseline.distribution.stats();
  let current = SampleStats::of(samples);
  let score = ks_statistic(samples, &baseline.distribution);
  let sample_size = samples.len() as u64;

  let magnitude = match (base, current) {
    (Some(b), Some(c)) if b.std > 0.0 => Some((c.mean - b.mean).abs() / b.std),
    _ => None,
  };

  let status = if sample_size == 0 || sample_size < criteria.min_sample_size {
    DriftStatus::InsufficientData
  } else if score.is_some_and(|s| s > criteria.threshold) {
    DriftStatus::Drifted
  } else {
    DriftStatus::Stable
  };

  DriftRecord {
    drift_id: Uuid::new_v4(),
    model_version: baseline.model_version.clone(),
    metric: baseline.metric,
    drift_test: DriftTest::KolmogorovSmirnov,
    baseline_mean: base.map(|b| b.mean),
    baseline_std: base.map(|b| b.std),
    current_mean: current.map(|c| c.mean),
    current_std: current.map(|c| c.std),
    drift_score: score,
    drift_magnitude: magnitude,
    status,
    alert_sent: false,
    threshold: criteria.threshold,
    min_sample_size: criteria.min_sample_size,
    sample_size,
    window,
    evaluated_at,
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone};

  use super::*;
  use crate::prediction::ModelOutputs;

  fn window() -> DriftWindow {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    DriftWindow::new(start, start + Duration::days(1)).unwrap()
  }

  fn baseline(distribution: BaselineDistribution) -> DriftBaseline {
    DriftBaseline {
      model_version: "v1".into(),
      metric: DriftMetric::ConditionScore,
      distribution,
      captured_at: Utc::now(),
    }
  }

  /// Deterministic values with the given mean and population std.
  fn spread(mean: f64, std: f64, n: usize) -> Vec<f64> {
    (0..n)
      .map(|i| if i % 2 == 0 { mean + std } else { mean - std })
      .collect()
  }

  const CRITERIA: DriftCriteria = DriftCriteria { threshold: 0.2, min_sample_size: 30 };

  #[test]
  fn shifted_window_drifts_against_normal_baseline() {
    let base = baseline(BaselineDistribution::Normal { mean: 0.6, std: 0.1 });
    let samples = spread(0.9, 0.05, 200);
    let record = assess(&base, &samples, window(), CRITERIA, Utc::now());

    assert_eq!(record.sample_size, 200);
    assert!(record.drift_score.unwrap() > CRITERIA.threshold);
    assert!(record.drift_detected());
    assert!((record.current_mean.unwrap() - 0.9).abs() < 1e-9);
    assert!((record.current_std.unwrap() - 0.05).abs() < 1e-9);
    assert!((record.drift_magnitude.unwrap() - 3.0).abs() < 1e-9);
    assert_eq!(record.drift_test, DriftTest::KolmogorovSmirnov);
  }

  #[test]
  fn small_window_is_insufficient_not_drifted() {
    let base = baseline(BaselineDistribution::Normal { mean: 0.6, std: 0.1 });
    let samples = spread(0.95, 0.01, 10);
    let record = assess(&base, &samples, window(), CRITERIA, Utc::now());

    assert_eq!(record.status, DriftStatus::InsufficientData);
    assert!(!record.drift_detected());
    assert!(record.drift_score.is_some());
  }

  #[test]
  fn empty_window_is_insufficient() {
    let base = baseline(BaselineDistribution::Normal { mean: 0.6, std: 0.1 });
    let record = assess(&base, &[], window(), CRITERIA, Utc::now());
    assert_eq!(record.status, DriftStatus::InsufficientData);
    assert_eq!(record.sample_size, 0);
    assert_eq!(record.drift_score, None);
  }

  #[test]
  fn same_distribution_is_stable() {
    let reference = BaselineDistribution::empirical((0..100).map(|i| i as f64 / 100.0).collect());
    let samples: Vec<f64> = (0..100).map(|i| (i as f64 + 0.5) / 100.0).collect();
    let record = assess(&baseline(reference), &samples, window(), CRITERIA, Utc::now());
    assert_eq!(record.status, DriftStatus::Stable);
    assert!(record.drift_score.unwrap() <= 0.02);
  }

  #[test]
  fn two_sample_ks_of_disjoint_samples_is_one() {
    let a = BaselineDistribution::empirical(vec![0.1, 0.2, 0.3]);
    assert!((ks_statistic(&[0.7, 0.8, 0.9], &a).unwrap() - 1.0).abs() < 1e-12);
  }

  #[test]
  fn ratio_metric_samples_an_indicator() {
    let scored = |condition: f64| PredictionRecord {
      prediction_id: Uuid::new_v4(),
      sequence:      0,
      image_id:      Uuid::new_v4(),
      listing_id:    Uuid::nil(),
      model_version: "v1".into(),
      captured_at:   window().start,
      recorded_at:   window().start,
      outputs:       ModelOutputs { condition_score: Some(condition), ..Default::default() },
    };
    let metric = DriftMetric::ConditionGoodRatio;
    assert_eq!(metric.sample(&scored(GOOD_CONDITION)), Some(1.0));
    assert_eq!(metric.sample(&scored(0.79)), Some(0.0));
    assert_eq!(metric.sample(&scored(0.0)), Some(0.0));

    // Baseline: half the images are good. Current: all are good.
    let reference: Vec<f64> = (0..100)
      .map(|i| if i % 2 == 0 { 0.9 } else { 0.4 })
      .filter_map(|c| metric.sample(&scored(c)))
      .collect();
    let samples: Vec<f64> = (0..100)
      .filter_map(|i| metric.sample(&scored(0.8 + f64::from(i) / 1000.0)))
      .collect();
    assert_eq!(samples, vec![1.0; 100]);

    let base = DriftBaseline {
      metric,
      ..baseline(BaselineDistribution::empirical(reference))
    };
    let record = assess(&base, &samples, window(), CRITERIA, Utc::now());
    assert_eq!(record.metric, metric);
    assert!((record.drift_score.unwrap() - 0.5).abs() < 1e-12);
    assert!(record.drift_detected());

    let unscored = PredictionRecord { outputs: ModelOutputs::default(), ..scored(0.5) };
    assert_eq!(metric.sample(&unscored), None);
  }

  #[test]
  fn inverted_window_is_rejected() {
    let start = Utc::now();
    assert!(DriftWindow::new(start, start).is_err());
    assert!(DriftWindow::new(start, start - Duration::seconds(1)).is_err());
  }

  #[test]
  fn metric_names_roundtrip() {
    for m in DriftMetric::ALL {
      assert_eq!(DriftMetric::parse(m.as_str()).unwrap(), m);
    }
    assert!(DriftMetric::parse("bogus").is_err());
  }
}
