//! The Aggregator: streaming, per-listing summaries of model output.
//!
//! A new prediction is folded into the stored aggregate in O(1). A full
//! rebuild happens on [`Aggregator::recompute`], when the stored aggregate
//! came from an older calculation version, or when the image already has
//! another record (a plain fold would count that image twice).
//!
//! A rebuild folds the latest processed record of each image, plus the
//! record that triggered it. Records that are persisted but still waiting
//! for their own delivery are left out, so they keep their change detection.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use estate_core::{
  aggregation::{CALCULATION_VERSION, PropertyAggregation},
  change::TemporalChangeEvent,
  prediction::PredictionRecord,
  store::{AggregateReplacement, IngestCommit, IntelligenceStore, StoreError},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
  Error, Result,
  config::{AggregationConfig, RetryConfig},
  locks::ListingLocks,
  retry::with_retry,
};

pub struct Aggregator<S> {
  store:  Arc<S>,
  locks:  Arc<ListingLocks>,
  config: AggregationConfig,
  retry:  RetryConfig,
}

impl<S: IntelligenceStore> Aggregator<S> {
  pub(crate) fn new(
    store: Arc<S>,
    locks: Arc<ListingLocks>,
    config: AggregationConfig,
    retry: RetryConfig,
  ) -> Self {
    Self { store, locks, config, retry }
  }

  /// Fold a recorded prediction into its listing's aggregate.
  ///
  /// Each prediction is applied at most once; a repeat returns
  /// [`Error::AlreadyProcessed`].
  pub async fn update(
    &self,
    listing_id: Uuid,
    record: &PredictionRecord,
  ) -> Result<PropertyAggregation> {
    check_input(listing_id, record)?;
    self.require_listing(listing_id).await?;

    let _guard = self.locks.lock(listing_id).await;
    self.apply_locked(record, &[]).await
  }

  /// Rebuild the aggregate from the listing's processed predictions and
  /// replace it atomically.
  pub async fn recompute(&self, listing_id: Uuid) -> Result<PropertyAggregation> {
    self.require_listing(listing_id).await?;

    let _guard = self.locks.lock(listing_id).await;
    let agg = with_retry(&self.retry, "recompute", move || {
      self.try_rebuild(listing_id, None, &[])
    })
    .await
    .map_err(Error::store)?;

    info!(
      %listing_id,
      total_images = agg.total_images,
      revision = agg.revision,
      "aggregate recomputed"
    );
    Ok(agg)
  }

  /// Recompute every aggregate built by an older calculation version.
  /// Returns the listings rebuilt.
  pub async fn recompute_stale(&self) -> Result<Vec<Uuid>> {
    let stale = self
      .store
      .stale_aggregations(CALCULATION_VERSION)
      .await
      .map_err(Error::store)?;

    for &listing_id in &stale {
      self.recompute(listing_id).await?;
    }
    self.locks.prune();
    Ok(stale)
  }

  pub async fn get(&self, listing_id: Uuid) -> Result<Option<PropertyAggregation>> {
    self.store.get_aggregation(listing_id).await.map_err(Error::store)
  }

  pub fn config(&self) -> &AggregationConfig { &self.config }

  pub(crate) fn locks(&self) -> &ListingLocks { &self.locks }

  /// Apply `record` and commit `events` with it. The caller holds the
  /// listing's lock.
  pub(crate) async fn apply_locked(
    &self,
    record: &PredictionRecord,
    events: &[TemporalChangeEvent],
  ) -> Result<PropertyAggregation> {
    let applied = with_retry(&self.retry, "aggregate update", move || {
      self.try_apply(record, events)
    })
    .await
    .map_err(|e| {
      if e.is_already_processed() {
        Error::AlreadyProcessed(record.prediction_id)
      } else {
        Error::store(e)
      }
    })?;

    let agg = applied.ok_or(Error::AlreadyProcessed(record.prediction_id))?;
    info!(
      listing_id = %agg.listing_id,
      image_id = %record.image_id,
      total_images = agg.total_images,
      revision = agg.revision,
      "aggregate committed"
    );
    Ok(agg)
  }

  async fn require_listing(&self, listing_id: Uuid) -> Result<()> {
    let exists = self
      .store
      .listing_exists(listing_id)
      .await
      .map_err(Error::store)?;
    if exists { Ok(()) } else { Err(Error::ListingNotFound(listing_id)) }
  }

  /// One read-modify-write attempt. `None` if the record is already in.
  async fn try_apply(
    &self,
    record: &PredictionRecord,
    events: &[TemporalChangeEvent],
  ) -> Result<Option<PropertyAggregation>, S::Error> {
    if self.store.is_processed(record.prediction_id).await? {
      return Ok(None);
    }

    let current = self.store.get_aggregation(record.listing_id).await?;
    let stale = current.as_ref().is_some_and(|a| !a.is_current());
    if stale || self.store.shares_image(record.image_id, record.sequence).await? {
      debug!(
        listing_id = %record.listing_id,
        image_id = %record.image_id,
        stale,
        "full rebuild instead of incremental fold"
      );
      return self
        .try_rebuild(record.listing_id, Some(record), events)
        .await
        .map(Some);
    }

    let now = Utc::now();
    let expected_revision = current.as_ref().map(|a| a.revision);
    let mut agg = current.unwrap_or_else(|| {
      PropertyAggregation::empty(record.listing_id, self.config.feature_capacity, now)
    });
    agg.fold(record, now);
    agg.revision = next_revision(expected_revision);

    self
      .store
      .commit_ingestion(IngestCommit {
        prediction_id: record.prediction_id,
        expected_revision,
        aggregation: agg.clone(),
        events: events.to_vec(),
      })
      .await?;
    Ok(Some(agg))
  }

  /// Rebuild from the latest processed record of each image. `trigger` is
  /// folded in as if processed, and is the only record marked processed.
  async fn try_rebuild(
    &self,
    listing_id: Uuid,
    trigger: Option<&PredictionRecord>,
    events: &[TemporalChangeEvent],
  ) -> Result<PropertyAggregation, S::Error> {
    let expected_revision = self
      .store
      .get_aggregation(listing_id)
      .await?
      .map(|a| a.revision);
    let mut records = self.store.list_processed_predictions(listing_id).await?;
    if let Some(t) = trigger
      && !records.iter().any(|r| r.prediction_id == t.prediction_id)
    {
      records.push(t.clone());
    }
    let current = latest_per_image(records);

    let mut agg = PropertyAggregation::rebuild(
      listing_id,
      self.config.feature_capacity,
      &current,
      Utc::now(),
    );
    agg.revision = next_revision(expected_revision);

    self
      .store
      .replace_aggregation(AggregateReplacement {
        expected_revision,
        aggregation: agg.clone(),
        processed: trigger.map(|t| t.prediction_id).into_iter().collect(),
        events: events.to_vec(),
      })
      .await?;
    Ok(agg)
  }
}

/// Keep the highest-sequence record of each image.
fn latest_per_image(records: Vec<PredictionRecord>) -> Vec<PredictionRecord> {
  let mut latest: HashMap<Uuid, PredictionRecord> = HashMap::new();
  for record in records {
    match latest.get(&record.image_id) {
      Some(kept) if kept.sequence > record.sequence => {}
      _ => {
        latest.insert(record.image_id, record);
      }
    }
  }
  latest.into_values().collect()
}

fn next_revision(expected: Option<u64>) -> u64 { expected.map_or(1, |r| r + 1) }

/// Reject input that must never reach the store.
pub(crate) fn check_input(listing_id: Uuid, record: &PredictionRecord) -> Result<()> {
  if record.listing_id != listing_id {
    return Err(Error::validation(format!(
      "prediction {} belongs to listing {}, not {listing_id}",
      record.prediction_id, record.listing_id
    )));
  }
  record.outputs.validate()?;
  Ok(())
}
