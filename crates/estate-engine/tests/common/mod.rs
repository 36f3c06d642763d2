//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::{
  collections::BTreeSet,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::{DateTime, TimeZone, Utc};
use estate_core::{
  prediction::{LabelScore, ModelOutputs, NewPrediction, PredictionRecord},
  store::IntelligenceStore,
};
use estate_engine::{AlertSink, DriftAlert, EngineConfig, NotificationError, config::RetryConfig};
use estate_store_sqlite::SqliteStore;
use uuid::Uuid;

pub async fn store() -> Arc<SqliteStore> {
  Arc::new(SqliteStore::open_in_memory().await.expect("in-memory store"))
}

/// Default policy with millisecond backoff.
pub fn config() -> EngineConfig {
  EngineConfig {
    retry: RetryConfig { max_attempts: 20, initial_backoff_ms: 1, max_backoff_ms: 4 },
    ..Default::default()
  }
}

pub fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap() }

pub async fn listing(store: &SqliteStore) -> Uuid {
  let id = Uuid::new_v4();
  store.register_listing(id).await.unwrap();
  id
}

pub fn kitchen(condition: f64) -> ModelOutputs {
  ModelOutputs {
    room_type: Some(LabelScore::new("kitchen", 0.92)),
    condition_score: Some(condition),
    natural_light_score: Some(0.6),
    style: Some(LabelScore::new("modern", 0.8)),
    feature_tags: Some(BTreeSet::from(["island".to_owned(), "hardwood_floor".to_owned()])),
    ..Default::default()
  }
}

pub fn capture(
  listing_id: Uuid,
  image_id: Uuid,
  captured_at: DateTime<Utc>,
  outputs: ModelOutputs,
) -> NewPrediction {
  NewPrediction::new(listing_id, image_id, "v1", captured_at, outputs)
}

/// Persist without processing.
pub async fn record(
  store: &SqliteStore,
  listing_id: Uuid,
  captured_at: DateTime<Utc>,
  outputs: ModelOutputs,
) -> PredictionRecord {
  store
    .record_prediction(capture(listing_id, Uuid::new_v4(), captured_at, outputs))
    .await
    .unwrap()
}

/// Remembers every alert; fails while `fail` is set.
#[derive(Debug, Default)]
pub struct RecordingSink {
  pub fail: AtomicBool,
  sent:     Mutex<Vec<DriftAlert>>,
}

impl RecordingSink {
  pub fn failing() -> Self {
    Self { fail: AtomicBool::new(true), ..Default::default() }
  }

  pub fn sent(&self) -> Vec<DriftAlert> { self.sent.lock().unwrap().clone() }
}

impl AlertSink for RecordingSink {
  async fn send<'a>(&'a self, alert: &'a DriftAlert) -> Result<(), NotificationError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(NotificationError::Unavailable("sink down".into()));
    }
    self.sent.lock().unwrap().push(alert.clone());
    Ok(())
  }
}
