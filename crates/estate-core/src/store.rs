//! The `IntelligenceStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g. `estate-store-sqlite`).
//! The engine depends on this abstraction, not on any concrete backend.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  aggregation::PropertyAggregation,
  change::{ChangeType, TemporalChangeEvent},
  drift::{DriftBaseline, DriftMetric, DriftRecord, DriftWindow},
  listing::Listing,
  prediction::{NewPrediction, PredictionRecord},
};

// ─── Error classification ────────────────────────────────────────────────────

/// Lets the engine decide how to react to a backend error without knowing
/// the backend.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  /// An optimistic-concurrency check failed; re-read and retry.
  fn is_conflict(&self) -> bool;

  /// The prediction was already folded into its listing's aggregate.
  fn is_already_processed(&self) -> bool;

  /// Worth retrying with backoff (storage busy or unavailable).
  fn is_transient(&self) -> bool;
}

// ─── Unit-of-work inputs ─────────────────────────────────────────────────────

/// One ingestion, committed atomically: the processed marker, the updated
/// aggregate and any change events.
#[derive(Debug, Clone)]
pub struct IngestCommit {
  pub prediction_id:     Uuid,
  /// `None` if no aggregate may exist yet for the listing.
  pub expected_revision: Option<u64>,
  pub aggregation:       PropertyAggregation,
  pub events:            Vec<TemporalChangeEvent>,
}

/// A full rebuild of a listing's aggregate.
#[derive(Debug, Clone)]
pub struct AggregateReplacement {
  pub expected_revision: Option<u64>,
  pub aggregation:       PropertyAggregation,
  /// Marked processed with the rebuild. Records not listed here are left
  /// for their own delivery.
  pub processed:         Vec<Uuid>,
  /// Change events produced alongside the rebuild, if any.
  pub events:            Vec<TemporalChangeEvent>,
}

// ─── Query types ─────────────────────────────────────────────────────────────

/// Locates the most recent prediction strictly older than a given one.
#[derive(Debug, Clone)]
pub struct PriorQuery {
  pub listing_id:  Uuid,
  /// Excluded: a re-inference of the same image is not a prior observation.
  pub image_id:    Uuid,
  pub captured_at: DateTime<Utc>,
  pub sequence:    i64,
  /// Restrict to this room-type label.
  pub room_type:   Option<String>,
}

impl PriorQuery {
  pub fn before(record: &PredictionRecord, match_room_type: bool) -> Self {
    Self {
      listing_id:  record.listing_id,
      image_id:    record.image_id,
      captured_at: record.captured_at,
      sequence:    record.sequence,
      room_type:   match_room_type
        .then(|| record.room_type().map(str::to_owned))
        .flatten(),
    }
  }
}

/// Parameters for [`IntelligenceStore::list_change_events`].
#[derive(Debug, Clone, Default)]
pub struct ChangeQuery {
  pub listing_id:   Option<Uuid>,
  pub flagged_only: bool,
  pub change_type:  Option<ChangeType>,
  pub limit:        Option<usize>,
}

/// Parameters for [`IntelligenceStore::list_drift_records`].
#[derive(Debug, Clone, Default)]
pub struct DriftQuery {
  pub model_version: Option<String>,
  pub metric:        Option<DriftMetric>,
  pub detected_only: bool,
  pub limit:         Option<usize>,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a property-intelligence store backend.
///
/// Prediction records and change events are append-only. Aggregates are
/// replaced under an optimistic revision check. Drift records are upserted
/// on `(model_version, metric, window)`.
///
/// All methods return `Send` futures so the trait can be used in multi-threaded
/// async runtimes.
pub trait IntelligenceStore: Send + Sync {
  type Error: StoreError;

  // ── Listings ──────────────────────────────────────────────────────────

  /// Register a listing with a caller-supplied UUID. Idempotent.
  fn register_listing(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Listing, Self::Error>> + Send + '_;

  fn listing_exists(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn list_listings(
    &self,
  ) -> impl Future<Output = Result<Vec<Listing>, Self::Error>> + Send + '_;

  // ── Predictions (append-only) ─────────────────────────────────────────

  /// Persist a prediction. `prediction_id`, `sequence` and `recorded_at`
  /// are assigned by the store.
  fn record_prediction(
    &self,
    input: NewPrediction,
  ) -> impl Future<Output = Result<PredictionRecord, Self::Error>> + Send + '_;

  fn get_prediction(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<PredictionRecord>, Self::Error>> + Send + '_;

  /// All predictions for a listing in sequence order. With `current_only`,
  /// only the latest record per image is returned.
  fn list_predictions(
    &self,
    listing_id: Uuid,
    current_only: bool,
  ) -> impl Future<Output = Result<Vec<PredictionRecord>, Self::Error>> + Send + '_;

  /// Predictions for a listing that are marked processed, in sequence order.
  fn list_processed_predictions(
    &self,
    listing_id: Uuid,
  ) -> impl Future<Output = Result<Vec<PredictionRecord>, Self::Error>> + Send + '_;

  /// `true` if `image_id` has any record other than the one at `sequence`,
  /// earlier or later.
  fn shares_image(
    &self,
    image_id: Uuid,
    sequence: i64,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// The latest current prediction ordered before `query` by
  /// `(captured_at, sequence)`.
  fn latest_prior_prediction(
    &self,
    query: PriorQuery,
  ) -> impl Future<Output = Result<Option<PredictionRecord>, Self::Error>> + Send + '_;

  /// Predictions by `model_version` captured within `window`.
  fn predictions_in_window(
    &self,
    model_version: String,
    window: DriftWindow,
  ) -> impl Future<Output = Result<Vec<PredictionRecord>, Self::Error>> + Send + '_;

  fn model_versions(
    &self,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + '_;

  // ── Aggregates ────────────────────────────────────────────────────────

  fn get_aggregation(
    &self,
    listing_id: Uuid,
  ) -> impl Future<Output = Result<Option<PropertyAggregation>, Self::Error>> + Send + '_;

  fn is_processed(
    &self,
    prediction_id: Uuid,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Atomically mark the prediction processed, replace the aggregate if its
  /// stored revision equals `expected_revision`, and append the events.
  fn commit_ingestion(
    &self,
    commit: IngestCommit,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Atomically replace the aggregate under the revision check.
  fn replace_aggregation(
    &self,
    replacement: AggregateReplacement,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Listings whose aggregate was computed with a calculation version other
  /// than `version`.
  fn stale_aggregations(
    &self,
    version: u32,
  ) -> impl Future<Output = Result<Vec<Uuid>, Self::Error>> + Send + '_;

  // ── Change events ─────────────────────────────────────────────────────

  /// Newest first.
  fn list_change_events<'a>(
    &'a self,
    query: &'a ChangeQuery,
  ) -> impl Future<Output = Result<Vec<TemporalChangeEvent>, Self::Error>> + Send + 'a;

  // ── Drift ─────────────────────────────────────────────────────────────

  /// Insert or replace the baseline for `(model_version, metric)`.
  fn put_baseline(
    &self,
    baseline: DriftBaseline,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn get_baseline(
    &self,
    model_version: String,
    metric: DriftMetric,
  ) -> impl Future<Output = Result<Option<DriftBaseline>, Self::Error>> + Send + '_;

  /// Upsert on `(model_version, metric, window)` as a single statement. An
  /// `alert_sent = true` already on the row is preserved. Returns the row as
  /// stored.
  fn upsert_drift_record(
    &self,
    record: DriftRecord,
  ) -> impl Future<Output = Result<DriftRecord, Self::Error>> + Send + '_;

  fn mark_alert_sent(
    &self,
    drift_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Drifted records whose alert has not been delivered.
  fn pending_alerts(
    &self,
  ) -> impl Future<Output = Result<Vec<DriftRecord>, Self::Error>> + Send + '_;

  /// Newest window first.
  fn list_drift_records<'a>(
    &'a self,
    query: &'a DriftQuery,
  ) -> impl Future<Output = Result<Vec<DriftRecord>, Self::Error>> + Send + 'a;
}
