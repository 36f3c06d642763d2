//! Error taxonomy for `estate-engine`.

use estate_core::{drift::DriftMetric, store::StoreError};
use thiserror::Error;
use uuid::Uuid;

use crate::sink::NotificationError;

#[derive(Debug, Error)]
pub enum Error {
  /// Malformed or out-of-range input. Never retried.
  #[error("validation error: {0}")]
  Validation(String),

  #[error("listing not found: {0}")]
  ListingNotFound(Uuid),

  #[error("prediction not found: {0}")]
  PredictionNotFound(Uuid),

  /// The prediction's contribution is already in its aggregate. Redelivery
  /// callers may treat this as success.
  #[error("prediction {0} is already processed")]
  AlreadyProcessed(Uuid),

  /// Optimistic revision checks kept failing after every fresh read.
  #[error("concurrency conflict: {0}")]
  ConcurrencyConflict(#[source] Box<dyn std::error::Error + Send + Sync>),

  /// Storage failed, after retries where retrying made sense. The caller
  /// should redeliver.
  #[error("persistence error: {0}")]
  Persistence(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("no baseline for model {model_version:?} metric {metric}")]
  BaselineNotFound {
    model_version: String,
    metric:        DriftMetric,
  },

  #[error("notification error: {0}")]
  Notification(#[from] NotificationError),
}

impl Error {
  pub(crate) fn validation(msg: impl Into<String>) -> Self {
    Self::Validation(msg.into())
  }

  /// Classify a backend error that survived the retry loop.
  pub(crate) fn store<E: StoreError>(e: E) -> Self {
    if e.is_conflict() {
      Self::ConcurrencyConflict(Box::new(e))
    } else {
      Self::Persistence(Box::new(e))
    }
  }
}

impl From<estate_core::Error> for Error {
  fn from(e: estate_core::Error) -> Self {
    match e {
      estate_core::Error::Validation(msg) => Self::Validation(msg),
      estate_core::Error::UnknownMetric(_) => Self::Validation(e.to_string()),
      estate_core::Error::Serialization(_) => Self::Persistence(Box::new(e)),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn core_errors_keep_their_class() {
    let err: Error = estate_core::Error::Validation("condition out of range".into()).into();
    assert!(matches!(err, Error::Validation(ref m) if m == "condition out of range"));

    let err: Error = estate_core::Error::UnknownMetric("sharpness".into()).into();
    assert!(matches!(err, Error::Validation(ref m) if m.contains("sharpness")));

    let json = serde_json::from_str::<u32>("not json").unwrap_err();
    let err: Error = estate_core::Error::Serialization(json).into();
    assert!(matches!(err, Error::Persistence(_)));
  }
}
