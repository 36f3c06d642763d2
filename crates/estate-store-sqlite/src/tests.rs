//! Integration tests for `SqliteStore` against an in-memory database.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use estate_core::{
  aggregation::{CALCULATION_VERSION, PropertyAggregation},
  change::{ChangePolicy, ChangeType, compare},
  drift::{
    BaselineDistribution, DriftBaseline, DriftCriteria, DriftMetric,
    DriftStatus, DriftWindow, assess,
  },
  prediction::{LabelScore, ModelOutputs, NewPrediction, PredictionRecord},
  store::{
    AggregateReplacement, ChangeQuery, DriftQuery, IngestCommit,
    IntelligenceStore, PriorQuery, StoreError,
  },
};
use uuid::Uuid;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() }

fn outputs(room: &str, condition: f64) -> ModelOutputs {
  ModelOutputs {
    room_type: Some(LabelScore::new(room, 0.9)),
    condition_score: Some(condition),
    natural_light_score: Some(0.5),
    feature_tags: Some(BTreeSet::from(["hardwood_floor".to_owned()])),
    ..Default::default()
  }
}

async fn listing(s: &SqliteStore) -> Uuid {
  let id = Uuid::new_v4();
  s.register_listing(id).await.unwrap();
  id
}

async fn record(
  s: &SqliteStore,
  listing_id: Uuid,
  image_id: Uuid,
  captured_at: DateTime<Utc>,
  outputs: ModelOutputs,
) -> PredictionRecord {
  s.record_prediction(NewPrediction::new(
    listing_id,
    image_id,
    "v1",
    captured_at,
    outputs,
  ))
  .await
  .unwrap()
}

// ─── Listings ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn register_listing_is_idempotent() {
  let s = store().await;
  let id = Uuid::new_v4();

  let first = s.register_listing(id).await.unwrap();
  let second = s.register_listing(id).await.unwrap();
  assert_eq!(first, second);

  assert!(s.listing_exists(id).await.unwrap());
  assert!(!s.listing_exists(Uuid::new_v4()).await.unwrap());
  assert_eq!(s.list_listings().await.unwrap().len(), 1);
}

// ─── Predictions ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn record_prediction_requires_listing() {
  let s = store().await;
  let missing = Uuid::new_v4();

  let err = s
    .record_prediction(NewPrediction::new(
      missing,
      Uuid::new_v4(),
      "v1",
      t0(),
      outputs("kitchen", 0.5),
    ))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::ListingNotFound(id) if id == missing));
}

#[tokio::test]
async fn record_prediction_rejects_invalid_outputs() {
  let s = store().await;
  let l = listing(&s).await;

  let err = s
    .record_prediction(NewPrediction::new(
      l,
      Uuid::new_v4(),
      "v1",
      t0(),
      ModelOutputs { condition_score: Some(1.5), ..Default::default() },
    ))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Core(_)));
  assert!(s.list_predictions(l, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn record_and_get_prediction() {
  let s = store().await;
  let l = listing(&s).await;

  let a = record(&s, l, Uuid::new_v4(), t0(), outputs("kitchen", 0.4)).await;
  let b = record(&s, l, Uuid::new_v4(), t0(), outputs("bedroom", 0.7)).await;
  assert!(b.sequence > a.sequence);

  let fetched = s.get_prediction(a.prediction_id).await.unwrap().unwrap();
  assert_eq!(fetched, a);
  assert!(s.get_prediction(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn current_only_hides_superseded_records() {
  let s = store().await;
  let l = listing(&s).await;
  let image = Uuid::new_v4();

  let old = record(&s, l, image, t0(), outputs("kitchen", 0.4)).await;
  let new = record(&s, l, image, t0(), outputs("kitchen", 0.6)).await;
  let other = record(&s, l, Uuid::new_v4(), t0(), outputs("bath", 0.5)).await;

  let all = s.list_predictions(l, false).await.unwrap();
  assert_eq!(all.len(), 3);

  let current: Vec<Uuid> = s
    .list_predictions(l, true)
    .await
    .unwrap()
    .into_iter()
    .map(|p| p.prediction_id)
    .collect();
  assert_eq!(current, vec![new.prediction_id, other.prediction_id]);

  assert!(s.shares_image(image, old.sequence).await.unwrap());
  assert!(s.shares_image(image, new.sequence).await.unwrap());
  assert!(!s.shares_image(other.image_id, other.sequence).await.unwrap());
}

#[tokio::test]
async fn latest_prior_orders_by_capture_time() {
  let s = store().await;
  let l = listing(&s).await;

  // Ingested out of capture order.
  let later =
    record(&s, l, Uuid::new_v4(), t0() + Duration::days(2), outputs("kitchen", 0.5)).await;
  let earliest = record(&s, l, Uuid::new_v4(), t0(), outputs("kitchen", 0.3)).await;
  let middle =
    record(&s, l, Uuid::new_v4(), t0() + Duration::days(1), outputs("kitchen", 0.4)).await;

  let prior = s
    .latest_prior_prediction(PriorQuery::before(&later, true))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(prior.prediction_id, middle.prediction_id);

  let prior = s
    .latest_prior_prediction(PriorQuery::before(&middle, true))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(prior.prediction_id, earliest.prediction_id);

  assert!(
    s.latest_prior_prediction(PriorQuery::before(&earliest, true))
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn latest_prior_respects_room_type_and_image() {
  let s = store().await;
  let l = listing(&s).await;
  let image = Uuid::new_v4();

  let kitchen = record(&s, l, Uuid::new_v4(), t0(), outputs("kitchen", 0.3)).await;
  record(&s, l, Uuid::new_v4(), t0() + Duration::hours(1), outputs("bedroom", 0.3)).await;
  // An earlier record of the same image never counts as its predecessor.
  record(&s, l, image, t0() + Duration::hours(2), outputs("kitchen", 0.3)).await;
  let current = record(&s, l, image, t0() + Duration::hours(3), outputs("kitchen", 0.6)).await;

  let prior = s
    .latest_prior_prediction(PriorQuery::before(&current, true))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(prior.prediction_id, kitchen.prediction_id);

  let any_room = s
    .latest_prior_prediction(PriorQuery::before(&current, false))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(any_room.room_type(), Some("bedroom"));
}

#[tokio::test]
async fn window_is_half_open() {
  let s = store().await;
  let l = listing(&s).await;
  let window = DriftWindow::new(t0(), t0() + Duration::hours(1)).unwrap();

  record(&s, l, Uuid::new_v4(), t0(), outputs("kitchen", 0.5)).await;
  record(&s, l, Uuid::new_v4(), t0() + Duration::minutes(59), outputs("kitchen", 0.5)).await;
  record(&s, l, Uuid::new_v4(), t0() + Duration::hours(1), outputs("kitchen", 0.5)).await;

  let inside = s.predictions_in_window("v1".into(), window).await.unwrap();
  assert_eq!(inside.len(), 2);
  assert!(inside.iter().all(|p| window.contains(p.captured_at)));

  assert!(s.predictions_in_window("v2".into(), window).await.unwrap().is_empty());
  assert_eq!(s.model_versions().await.unwrap(), vec!["v1".to_owned()]);
}

// ─── Aggregates ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn commit_ingestion_checks_revision_and_marker() {
  let s = store().await;
  let l = listing(&s).await;
  let first = record(&s, l, Uuid::new_v4(), t0(), outputs("kitchen", 0.4)).await;
  let second =
    record(&s, l, Uuid::new_v4(), t0() + Duration::days(30), outputs("kitchen", 0.75)).await;

  let mut agg = PropertyAggregation::empty(l, 64, Utc::now());
  agg.fold(&first, Utc::now());
  agg.revision = 1;
  s.commit_ingestion(IngestCommit {
    prediction_id:     first.prediction_id,
    expected_revision: None,
    aggregation:       agg.clone(),
    events:            vec![],
  })
  .await
  .unwrap();
  assert!(s.is_processed(first.prediction_id).await.unwrap());

  // Redelivery of the same prediction.
  let err = s
    .commit_ingestion(IngestCommit {
      prediction_id:     first.prediction_id,
      expected_revision: Some(1),
      aggregation:       agg.clone(),
      events:            vec![],
    })
    .await
    .unwrap_err();
  assert!(err.is_already_processed());

  // A writer that read before the first commit.
  let mut stale = agg.clone();
  stale.fold(&second, Utc::now());
  stale.revision = 1;
  let err = s
    .commit_ingestion(IngestCommit {
      prediction_id:     second.prediction_id,
      expected_revision: None,
      aggregation:       stale,
      events:            vec![],
    })
    .await
    .unwrap_err();
  assert!(err.is_conflict());
  assert!(!s.is_processed(second.prediction_id).await.unwrap());

  let events = compare(&first, &second, &ChangePolicy::default(), Utc::now());
  agg.fold(&second, Utc::now());
  agg.revision = 2;
  s.commit_ingestion(IngestCommit {
    prediction_id:     second.prediction_id,
    expected_revision: Some(1),
    aggregation:       agg.clone(),
    events:            events.clone(),
  })
  .await
  .unwrap();

  let stored = s.get_aggregation(l).await.unwrap().unwrap();
  assert_eq!(stored, agg);
  assert_eq!(stored.total_images, 2);

  let listed = s
    .list_change_events(&ChangeQuery { listing_id: Some(l), ..Default::default() })
    .await
    .unwrap();
  assert_eq!(listed.len(), events.len());
  let condition = listed
    .iter()
    .find(|e| e.change_type == ChangeType::Condition)
    .unwrap();
  assert!(condition.flagged_for_review);
  assert_eq!(condition.previous_prediction_id, first.prediction_id);
}

#[tokio::test]
async fn replace_aggregation_marks_listed_records_processed() {
  let s = store().await;
  let l = listing(&s).await;
  let a = record(&s, l, Uuid::new_v4(), t0(), outputs("kitchen", 0.4)).await;
  let b = record(&s, l, Uuid::new_v4(), t0(), outputs("bath", 0.6)).await;
  let pending = record(&s, l, Uuid::new_v4(), t0(), outputs("bath", 0.8)).await;

  let mut agg = PropertyAggregation::rebuild(l, 64, &[a.clone(), b.clone()], Utc::now());
  agg.revision = 1;
  s.replace_aggregation(AggregateReplacement {
    expected_revision: None,
    aggregation:       agg,
    processed:         vec![a.prediction_id, b.prediction_id],
    events:            vec![],
  })
  .await
  .unwrap();

  assert!(s.is_processed(a.prediction_id).await.unwrap());
  assert!(s.is_processed(b.prediction_id).await.unwrap());
  assert!(!s.is_processed(pending.prediction_id).await.unwrap());
  let processed: Vec<Uuid> = s
    .list_processed_predictions(l)
    .await
    .unwrap()
    .into_iter()
    .map(|p| p.prediction_id)
    .collect();
  assert_eq!(processed, vec![a.prediction_id, b.prediction_id]);
  assert!(s.stale_aggregations(CALCULATION_VERSION).await.unwrap().is_empty());
  assert_eq!(s.stale_aggregations(CALCULATION_VERSION + 1).await.unwrap(), vec![l]);
}

#[tokio::test]
async fn flagged_only_filters_change_events() {
  let s = store().await;
  let l = listing(&s).await;
  let mut before = outputs("kitchen", 0.50);
  before.natural_light_score = Some(0.40);
  let mut after = outputs("kitchen", 0.52);
  after.natural_light_score = Some(0.55);

  let p = record(&s, l, Uuid::new_v4(), t0(), before).await;
  let c = record(&s, l, Uuid::new_v4(), t0() + Duration::days(1), after).await;
  let events = compare(&p, &c, &ChangePolicy::default(), Utc::now());
  assert_eq!(events.len(), 1);

  let mut agg = PropertyAggregation::empty(l, 64, Utc::now());
  agg.revision = 1;
  s.replace_aggregation(AggregateReplacement {
    expected_revision: None,
    aggregation:       agg,
    processed:         vec![],
    events,
  })
  .await
  .unwrap();

  let all = s.list_change_events(&ChangeQuery::default()).await.unwrap();
  assert_eq!(all.len(), 1);
  let flagged = s
    .list_change_events(&ChangeQuery { flagged_only: true, ..Default::default() })
    .await
    .unwrap();
  assert!(flagged.is_empty());
}

// ─── Drift ───────────────────────────────────────────────────────────────────

fn drifted_record(window: DriftWindow) -> estate_core::drift::DriftRecord {
  let baseline = DriftBaseline {
    model_version: "v1".into(),
    metric:        DriftMetric::ConditionScore,
    distribution:  BaselineDistribution::Normal { mean: 0.6, std: 0.1 },
    captured_at:   t0(),
  };
  let samples = vec![0.95; 40];
  assess(
    &baseline,
    &samples,
    window,
    DriftCriteria { threshold: 0.2, min_sample_size: 30 },
    Utc::now(),
  )
}

#[tokio::test]
async fn baseline_round_trips_and_replaces() {
  let s = store().await;
  let mut baseline = DriftBaseline {
    model_version: "v1".into(),
    metric:        DriftMetric::NaturalLightGoodRatio,
    distribution:  BaselineDistribution::empirical(vec![1.0, 0.0, 1.0]),
    captured_at:   t0(),
  };
  s.put_baseline(baseline.clone()).await.unwrap();
  assert_eq!(
    s.get_baseline("v1".into(), DriftMetric::NaturalLightGoodRatio).await.unwrap(),
    Some(baseline.clone())
  );

  baseline.distribution = BaselineDistribution::Normal { mean: 0.5, std: 0.2 };
  s.put_baseline(baseline.clone()).await.unwrap();
  assert_eq!(
    s.get_baseline("v1".into(), DriftMetric::NaturalLightGoodRatio).await.unwrap(),
    Some(baseline)
  );
  assert!(
    s.get_baseline("v1".into(), DriftMetric::ConditionScore)
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn upsert_keeps_one_row_per_window_and_preserves_alert_flag() {
  let s = store().await;
  let window = DriftWindow::new(t0(), t0() + Duration::hours(24)).unwrap();

  let stored = s.upsert_drift_record(drifted_record(window)).await.unwrap();
  assert_eq!(stored.status, DriftStatus::Drifted);
  assert_eq!(s.pending_alerts().await.unwrap().len(), 1);

  s.mark_alert_sent(stored.drift_id).await.unwrap();
  assert!(s.pending_alerts().await.unwrap().is_empty());

  // Re-evaluation of the same window.
  let again = s.upsert_drift_record(drifted_record(window)).await.unwrap();
  assert_eq!(again.drift_id, stored.drift_id);
  assert!(again.alert_sent);

  let rows = s.list_drift_records(&DriftQuery::default()).await.unwrap();
  assert_eq!(rows.len(), 1);
  let detected = s
    .list_drift_records(&DriftQuery { detected_only: true, ..Default::default() })
    .await
    .unwrap();
  assert_eq!(detected.len(), 1);
}

#[tokio::test]
async fn mark_alert_sent_unknown_record() {
  let s = store().await;
  let missing = Uuid::new_v4();
  let err = s.mark_alert_sent(missing).await.unwrap_err();
  assert!(matches!(err, Error::DriftRecordNotFound(id) if id == missing));
}
