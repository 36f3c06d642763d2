//! The Temporal Change Detector.

use std::sync::Arc;

use chrono::Utc;
use estate_core::{
  change::{ChangePolicy, TemporalChangeEvent, compare},
  prediction::PredictionRecord,
  store::{IntelligenceStore, PriorQuery},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Error, Result, config::RetryConfig, retry::with_retry};

pub struct ChangeDetector<S> {
  store:  Arc<S>,
  policy: ChangePolicy,
  retry:  RetryConfig,
}

impl<S: IntelligenceStore> ChangeDetector<S> {
  pub(crate) fn new(store: Arc<S>, policy: ChangePolicy, retry: RetryConfig) -> Self {
    Self { store, policy, retry }
  }

  /// Compare `record` with the latest earlier capture of the same listing
  /// (and room type, per policy).
  ///
  /// `None` when there is nothing to compare against; the record then only
  /// establishes a baseline. Events are returned, not persisted.
  pub async fn detect(
    &self,
    listing_id: Uuid,
    record: &PredictionRecord,
  ) -> Result<Option<Vec<TemporalChangeEvent>>> {
    if record.listing_id != listing_id {
      return Err(Error::validation(format!(
        "prediction {} belongs to listing {}, not {listing_id}",
        record.prediction_id, record.listing_id
      )));
    }

    let query = PriorQuery::before(record, self.policy.match_room_type);
    let prior = with_retry(&self.retry, "prior lookup", move || {
      self.store.latest_prior_prediction(query.clone())
    })
    .await
    .map_err(Error::store)?;

    let Some(prior) = prior else {
      debug!(%listing_id, image_id = %record.image_id, "no prior capture; baseline only");
      return Ok(None);
    };

    let events = compare(&prior, record, &self.policy, Utc::now());
    for event in events.iter().filter(|e| e.flagged_for_review) {
      info!(
        %listing_id,
        image_id = %record.image_id,
        previous_image_id = %event.previous_image_id,
        change_type = %event.change_type,
        direction = %event.direction,
        magnitude = ?event.magnitude,
        "change flagged for review"
      );
    }
    Ok(Some(events))
  }

  pub fn policy(&self) -> &ChangePolicy { &self.policy }
}
