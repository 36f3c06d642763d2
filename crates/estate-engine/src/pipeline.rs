//! The ingestion unit of work.
//!
//! For each delivered prediction, under the listing's lock: skip it if it is
//! already processed, find its chronological predecessor, classify the
//! changes, fold it into the aggregate, and commit the aggregate together
//! with the change events.

use std::sync::Arc;

use estate_core::{
  aggregation::PropertyAggregation,
  change::TemporalChangeEvent,
  prediction::{NewPrediction, PredictionRecord},
  store::IntelligenceStore,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
  Aggregator, ChangeDetector, EngineConfig, Error, Result,
  aggregator::check_input,
  locks::ListingLocks,
  retry::with_retry,
};

/// What one ingested prediction produced.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
  pub prediction:  PredictionRecord,
  pub aggregation: PropertyAggregation,
  /// `None` for the listing's first comparable capture.
  pub changes:     Option<Vec<TemporalChangeEvent>>,
}

impl IngestOutcome {
  pub fn flagged(&self) -> impl Iterator<Item = &TemporalChangeEvent> {
    self.changes.iter().flatten().filter(|e| e.flagged_for_review)
  }
}

pub struct IngestPipeline<S> {
  store:      Arc<S>,
  aggregator: Aggregator<S>,
  detector:   ChangeDetector<S>,
  config:     EngineConfig,
}

impl<S: IntelligenceStore> IngestPipeline<S> {
  pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
    let locks = Arc::new(ListingLocks::default());
    let aggregator = Aggregator::new(
      Arc::clone(&store),
      locks,
      config.aggregation.clone(),
      config.retry.clone(),
    );
    let detector = ChangeDetector::new(
      Arc::clone(&store),
      config.change.clone(),
      config.retry.clone(),
    );
    Self { store, aggregator, detector, config }
  }

  pub fn aggregator(&self) -> &Aggregator<S> { &self.aggregator }

  pub fn detector(&self) -> &ChangeDetector<S> { &self.detector }

  pub fn store(&self) -> &Arc<S> { &self.store }

  /// Persist a freshly inferred prediction and process it.
  ///
  /// If processing fails after the record is persisted, the error is
  /// returned and the caller redelivers with [`Self::redeliver`].
  pub async fn ingest(&self, input: NewPrediction) -> Result<IngestOutcome> {
    input.outputs.validate()?;
    if !self
      .store
      .listing_exists(input.listing_id)
      .await
      .map_err(Error::store)?
    {
      return Err(Error::ListingNotFound(input.listing_id));
    }

    // Not retried: a failed insert may still have landed.
    let record = self
      .store
      .record_prediction(input)
      .await
      .map_err(Error::store)?;
    debug!(
      listing_id = %record.listing_id,
      image_id = %record.image_id,
      sequence = record.sequence,
      "prediction recorded"
    );

    self.process(record).await
  }

  /// Process an already persisted prediction by id.
  pub async fn redeliver(&self, prediction_id: Uuid) -> Result<IngestOutcome> {
    let record = with_retry(&self.config.retry, "prediction lookup", move || {
      self.store.get_prediction(prediction_id)
    })
    .await
    .map_err(Error::store)?
    .ok_or(Error::PredictionNotFound(prediction_id))?;

    self.process(record).await
  }

  /// Run detection and the aggregate update as one unit of work.
  pub async fn process(&self, record: PredictionRecord) -> Result<IngestOutcome> {
    let listing_id = record.listing_id;
    check_input(listing_id, &record)?;

    let outcome = {
      let _guard = self.aggregator.locks().lock(listing_id).await;

      let prediction_id = record.prediction_id;
      let processed = with_retry(&self.config.retry, "processed check", move || {
        self.store.is_processed(prediction_id)
      })
      .await
      .map_err(Error::store)?;
      if processed {
        return Err(Error::AlreadyProcessed(prediction_id));
      }

      let changes = self.detector.detect(listing_id, &record).await?;
      let events = changes.as_deref().unwrap_or_default();
      let aggregation = self.aggregator.apply_locked(&record, events).await?;

      IngestOutcome { prediction: record, aggregation, changes }
    };

    self.aggregator.locks().prune();
    Ok(outcome)
  }
}
