//! Engine configuration. Every section defaults, so a partial file works.

use std::time::Duration;

use estate_core::{change::ChangePolicy, drift::DriftMetric};
use serde::Deserialize;

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub aggregation: AggregationConfig,
  pub change:      ChangePolicy,
  pub drift:       DriftConfig,
  pub retry:       RetryConfig,
}

impl EngineConfig {
  /// Reject settings that would make the engine misbehave rather than fail.
  pub fn validate(&self) -> Result<()> {
    let agg = &self.aggregation;
    if agg.top_features == 0 || agg.feature_capacity < agg.top_features {
      return Err(Error::validation(format!(
        "aggregation.feature_capacity ({}) must be at least top_features ({}) and non-zero",
        agg.feature_capacity, agg.top_features
      )));
    }

    let change = &self.change;
    for (name, v) in [
      ("change.noise_floor", change.noise_floor),
      ("change.condition_threshold", change.condition_threshold),
      ("change.light_threshold", change.light_threshold),
      ("change.feature_set_threshold", change.feature_set_threshold),
    ] {
      if !(0.0..=1.0).contains(&v) {
        return Err(Error::validation(format!("{name} must lie in [0, 1], got {v}")));
      }
    }

    let drift = &self.drift;
    if !(drift.threshold > 0.0 && drift.threshold <= 1.0) {
      return Err(Error::validation(format!(
        "drift.threshold must lie in (0, 1], got {}",
        drift.threshold
      )));
    }
    if drift.window_hours == 0 || drift.interval_secs == 0 {
      return Err(Error::validation("drift.window_hours and drift.interval_secs must be positive"));
    }

    if self.retry.max_attempts == 0 {
      return Err(Error::validation("retry.max_attempts must be at least 1"));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
  /// Size of `common_features` reported from an aggregate.
  pub top_features:     usize,
  /// Bound on distinct tags tracked per listing.
  pub feature_capacity: usize,
}

impl Default for AggregationConfig {
  fn default() -> Self { Self { top_features: 10, feature_capacity: 64 } }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
  /// KS statistic above which a window is drifted.
  pub threshold:       f64,
  pub min_sample_size: u64,
  pub window_hours:    u32,
  /// Cadence of the periodic batch.
  pub interval_secs:   u64,
  pub metrics:         Vec<DriftMetric>,
}

impl Default for DriftConfig {
  fn default() -> Self {
    Self {
      threshold:       0.20,
      min_sample_size: 30,
      window_hours:    24,
      interval_secs:   3600,
      metrics:         DriftMetric::ALL.to_vec(),
    }
  }
}

impl DriftConfig {
  pub fn window(&self) -> chrono::Duration {
    chrono::Duration::hours(i64::from(self.window_hours))
  }

  pub fn interval(&self) -> Duration { Duration::from_secs(self.interval_secs) }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts including the first.
  pub max_attempts:       u32,
  /// Doubles after every failed attempt.
  pub initial_backoff_ms: u64,
  pub max_backoff_ms:     u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self { max_attempts: 5, initial_backoff_ms: 50, max_backoff_ms: 2000 }
  }
}

impl RetryConfig {
  pub fn initial_backoff(&self) -> Duration {
    Duration::from_millis(self.initial_backoff_ms)
  }

  pub fn max_backoff(&self) -> Duration { Duration::from_millis(self.max_backoff_ms) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = EngineConfig::default();
    config.validate().unwrap();
    assert_eq!(config.aggregation.top_features, 10);
    assert_eq!(config.change.noise_floor, 0.05);
    assert_eq!(config.drift.metrics.len(), DriftMetric::ALL.len());
  }

  #[test]
  fn capacity_below_top_features_is_rejected() {
    let mut config = EngineConfig::default();
    config.aggregation.feature_capacity = 5;
    assert!(matches!(config.validate(), Err(Error::Validation(_))));
  }
}
