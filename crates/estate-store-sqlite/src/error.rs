//! Error type for `estate-store-sqlite`.

use estate_core::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] estate_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored discriminant did not match any known variant.
  #[error("decode error: {0}")]
  Decode(String),

  #[error("listing not found: {0}")]
  ListingNotFound(Uuid),

  #[error("prediction {0} is already processed")]
  AlreadyProcessed(Uuid),

  #[error(
    "aggregate revision conflict for listing {listing_id}: expected {expected:?}, found {found:?}"
  )]
  RevisionConflict {
    listing_id: Uuid,
    expected:   Option<u64>,
    found:      Option<u64>,
  },

  #[error("drift record not found: {0}")]
  DriftRecordNotFound(Uuid),
}

impl StoreError for Error {
  fn is_conflict(&self) -> bool { matches!(self, Self::RevisionConflict { .. }) }

  fn is_already_processed(&self) -> bool {
    matches!(self, Self::AlreadyProcessed(_))
  }

  fn is_transient(&self) -> bool { matches!(self, Self::Database(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
