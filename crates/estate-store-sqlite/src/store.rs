//! [`SqliteStore`], the SQLite implementation of [`IntelligenceStore`].

use std::path::Path;

use chrono::Utc;
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use estate_core::{
  aggregation::PropertyAggregation,
  change::TemporalChangeEvent,
  drift::{DriftBaseline, DriftMetric, DriftRecord, DriftStatus, DriftWindow},
  listing::Listing,
  prediction::{NewPrediction, PredictionRecord},
  store::{
    AggregateReplacement, ChangeQuery, DriftQuery, IngestCommit,
    IntelligenceStore, PriorQuery,
  },
};

use crate::{
  encode::{
    DRIFT_COLUMNS, EncodedDrift, EncodedEvent, PREDICTION_COLUMNS, RawBaseline,
    RawListing, RawPrediction, decode_aggregation, decode_count, decode_uuid,
    encode_count, encode_dt, encode_uuid,
  },
  schema::SCHEMA,
  Error, Result,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A property intelligence store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

/// Result of a guarded write, decided inside the transaction.
enum WriteOutcome {
  Committed,
  AlreadyProcessed(Uuid),
  Conflict { found: Option<u64> },
}

/// An aggregate encoded for the `aggregations` table.
struct EncodedAggregate {
  listing_id:          String,
  revision:            i64,
  calculation_version: u32,
  total_images:        i64,
  last_calculated_at:  String,
  state_json:          String,
}

impl EncodedAggregate {
  fn encode(agg: &PropertyAggregation) -> Result<Self> {
    Ok(Self {
      listing_id:          encode_uuid(agg.listing_id),
      revision:            encode_count(agg.revision),
      calculation_version: agg.calculation_version,
      total_images:        encode_count(agg.total_images),
      last_calculated_at:  encode_dt(agg.last_calculated_at),
      state_json:          serde_json::to_string(agg)?,
    })
  }

  /// Check the stored revision against `expected` and write on a match.
  /// Returns the stored revision on a mismatch.
  fn write_guarded(
    &self,
    tx: &rusqlite::Transaction<'_>,
    expected: Option<u64>,
  ) -> rusqlite::Result<Result<(), Option<u64>>> {
    let found: Option<i64> = tx
      .query_row(
        "SELECT revision FROM aggregations WHERE listing_id = ?1",
        rusqlite::params![self.listing_id],
        |r| r.get(0),
      )
      .optional()?;
    let found = found.map(decode_count);
    if found != expected {
      return Ok(Err(found));
    }

    tx.execute(
      "INSERT INTO aggregations (
         listing_id, revision, calculation_version, total_images,
         last_calculated_at, state_json
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
       ON CONFLICT(listing_id) DO UPDATE SET
         revision            = excluded.revision,
         calculation_version = excluded.calculation_version,
         total_images        = excluded.total_images,
         last_calculated_at  = excluded.last_calculated_at,
         state_json          = excluded.state_json",
      rusqlite::params![
        self.listing_id,
        self.revision,
        self.calculation_version,
        self.total_images,
        self.last_calculated_at,
        self.state_json,
      ],
    )?;
    Ok(Ok(()))
  }
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run a `SELECT` over predictions with a caller-supplied tail and params.
  async fn query_predictions(
    &self,
    tail: &'static str,
    params: Vec<Box<dyn rusqlite::ToSql + Send>>,
  ) -> Result<Vec<PredictionRecord>> {
    let raws: Vec<RawPrediction> = self
      .conn
      .call(move |conn| {
        let sql = format!("SELECT {PREDICTION_COLUMNS} FROM predictions p {tail}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(
            rusqlite::params_from_iter(params.iter()),
            RawPrediction::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawPrediction::into_record).collect()
  }

  fn map_outcome(outcome: WriteOutcome, listing_id: Uuid, expected: Option<u64>) -> Result<()> {
    match outcome {
      WriteOutcome::Committed => Ok(()),
      WriteOutcome::AlreadyProcessed(id) => Err(Error::AlreadyProcessed(id)),
      WriteOutcome::Conflict { found } => {
        debug!(%listing_id, ?expected, ?found, "aggregate revision mismatch");
        Err(Error::RevisionConflict { listing_id, expected, found })
      }
    }
  }
}

// ─── IntelligenceStore impl ──────────────────────────────────────────────────

impl IntelligenceStore for SqliteStore {
  type Error = Error;

  // ── Listings ──────────────────────────────────────────────────────────────

  async fn register_listing(&self, id: Uuid) -> Result<Listing> {
    let id_str = encode_uuid(id);
    let at_str = encode_dt(Utc::now());

    let raw: RawListing = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO listings (listing_id, created_at) VALUES (?1, ?2)
           ON CONFLICT(listing_id) DO NOTHING",
          rusqlite::params![id_str, at_str],
        )?;
        Ok(conn.query_row(
          "SELECT listing_id, created_at FROM listings WHERE listing_id = ?1",
          rusqlite::params![id_str],
          |row| {
            Ok(RawListing { listing_id: row.get(0)?, created_at: row.get(1)? })
          },
        )?)
      })
      .await?;

    raw.into_listing()
  }

  async fn listing_exists(&self, id: Uuid) -> Result<bool> {
    let id_str = encode_uuid(id);
    let exists = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM listings WHERE listing_id = ?1",
              rusqlite::params![id_str],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;
    Ok(exists)
  }

  async fn list_listings(&self) -> Result<Vec<Listing>> {
    let raws: Vec<RawListing> = self
      .conn
      .call(|conn| {
        let mut stmt = conn
          .prepare("SELECT listing_id, created_at FROM listings ORDER BY created_at")?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawListing { listing_id: row.get(0)?, created_at: row.get(1)? })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawListing::into_listing).collect()
  }

  // ── Predictions (append-only) ──────────────────────────────────────────

  async fn record_prediction(&self, input: NewPrediction) -> Result<PredictionRecord> {
    input.outputs.validate()?;

    if !self.listing_exists(input.listing_id).await? {
      return Err(Error::ListingNotFound(input.listing_id));
    }

    let prediction_id = Uuid::new_v4();
    let recorded_at = Utc::now();

    let id_str         = encode_uuid(prediction_id);
    let image_str      = encode_uuid(input.image_id);
    let listing_str    = encode_uuid(input.listing_id);
    let model_version  = input.model_version.clone();
    let captured_str   = encode_dt(input.captured_at);
    let recorded_str   = encode_dt(recorded_at);
    let room_type      = input.outputs.room_type.as_ref().map(|r| r.label.clone());
    let outputs_json   = serde_json::to_string(&input.outputs)?;

    let sequence: i64 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO predictions (
             prediction_id, image_id, listing_id, model_version,
             captured_at, recorded_at, room_type, outputs_json
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          rusqlite::params![
            id_str,
            image_str,
            listing_str,
            model_version,
            captured_str,
            recorded_str,
            room_type,
            outputs_json,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(PredictionRecord {
      prediction_id,
      sequence,
      image_id: input.image_id,
      listing_id: input.listing_id,
      model_version: input.model_version,
      captured_at: input.captured_at,
      recorded_at,
      outputs: input.outputs,
    })
  }

  async fn get_prediction(&self, id: Uuid) -> Result<Option<PredictionRecord>> {
    let mut found = self
      .query_predictions(
        "WHERE p.prediction_id = ?1",
        vec![Box::new(encode_uuid(id))],
      )
      .await?;
    Ok(found.pop())
  }

  async fn list_predictions(
    &self,
    listing_id:   Uuid,
    current_only: bool,
  ) -> Result<Vec<PredictionRecord>> {
    let params: Vec<Box<dyn rusqlite::ToSql + Send>> =
      vec![Box::new(encode_uuid(listing_id))];
    if current_only {
      self
        .query_predictions(
          "WHERE p.listing_id = ?1
             AND NOT EXISTS (
               SELECT 1 FROM predictions q
               WHERE q.image_id = p.image_id AND q.sequence > p.sequence
             )
           ORDER BY p.sequence",
          params,
        )
        .await
    } else {
      self
        .query_predictions("WHERE p.listing_id = ?1 ORDER BY p.sequence", params)
        .await
    }
  }

  async fn list_processed_predictions(&self, listing_id: Uuid) -> Result<Vec<PredictionRecord>> {
    let params: Vec<Box<dyn rusqlite::ToSql + Send>> =
      vec![Box::new(encode_uuid(listing_id))];
    self
      .query_predictions(
        "WHERE p.listing_id = ?1
           AND EXISTS (
             SELECT 1 FROM processed_predictions m
             WHERE m.prediction_id = p.prediction_id
           )
         ORDER BY p.sequence",
        params,
      )
      .await
  }

  async fn shares_image(&self, image_id: Uuid, sequence: i64) -> Result<bool> {
    let image_str = encode_uuid(image_id);
    let found = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM predictions WHERE image_id = ?1 AND sequence != ?2 LIMIT 1",
              rusqlite::params![image_str, sequence],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;
    Ok(found)
  }

  async fn latest_prior_prediction(
    &self,
    query: PriorQuery,
  ) -> Result<Option<PredictionRecord>> {
    let params: Vec<Box<dyn rusqlite::ToSql + Send>> = vec![
      Box::new(encode_uuid(query.listing_id)),
      Box::new(encode_uuid(query.image_id)),
      Box::new(encode_dt(query.captured_at)),
      Box::new(query.sequence),
      Box::new(query.room_type),
    ];
    let mut found = self
      .query_predictions(
        "WHERE p.listing_id = ?1
           AND p.image_id != ?2
           AND (p.captured_at < ?3 OR (p.captured_at = ?3 AND p.sequence < ?4))
           AND (?5 IS NULL OR p.room_type = ?5)
           AND NOT EXISTS (
             SELECT 1 FROM predictions q
             WHERE q.image_id = p.image_id AND q.sequence > p.sequence
           )
         ORDER BY p.captured_at DESC, p.sequence DESC
         LIMIT 1",
        params,
      )
      .await?;
    Ok(found.pop())
  }

  async fn predictions_in_window(
    &self,
    model_version: String,
    window:        DriftWindow,
  ) -> Result<Vec<PredictionRecord>> {
    self
      .query_predictions(
        "WHERE p.model_version = ?1 AND p.captured_at >= ?2 AND p.captured_at < ?3
         ORDER BY p.sequence",
        vec![
          Box::new(model_version),
          Box::new(encode_dt(window.start)),
          Box::new(encode_dt(window.end)),
        ],
      )
      .await
  }

  async fn model_versions(&self) -> Result<Vec<String>> {
    let versions = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT DISTINCT model_version FROM predictions ORDER BY model_version",
        )?;
        let rows = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(versions)
  }

  // ── Aggregates ────────────────────────────────────────────────────────────

  async fn get_aggregation(&self, listing_id: Uuid) -> Result<Option<PropertyAggregation>> {
    let id_str = encode_uuid(listing_id);
    let state: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT state_json FROM aggregations WHERE listing_id = ?1",
              rusqlite::params![id_str],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    state.as_deref().map(decode_aggregation).transpose()
  }

  async fn is_processed(&self, prediction_id: Uuid) -> Result<bool> {
    let id_str = encode_uuid(prediction_id);
    let found = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM processed_predictions WHERE prediction_id = ?1",
              rusqlite::params![id_str],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;
    Ok(found)
  }

  async fn commit_ingestion(&self, commit: IngestCommit) -> Result<()> {
    let listing_id = commit.aggregation.listing_id;
    let expected   = commit.expected_revision;
    let prediction = commit.prediction_id;
    let pred_str   = encode_uuid(prediction);
    let now_str    = encode_dt(Utc::now());
    let aggregate  = EncodedAggregate::encode(&commit.aggregation)?;
    let events     = commit
      .events
      .iter()
      .map(EncodedEvent::encode)
      .collect::<Result<Vec<_>>>()?;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let processed = tx
          .query_row(
            "SELECT 1 FROM processed_predictions WHERE prediction_id = ?1",
            rusqlite::params![pred_str],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false);
        if processed {
          return Ok(WriteOutcome::AlreadyProcessed(prediction));
        }

        if let Err(found) = aggregate.write_guarded(&tx, expected)? {
          return Ok(WriteOutcome::Conflict { found });
        }

        tx.execute(
          "INSERT INTO processed_predictions (prediction_id, processed_at) VALUES (?1, ?2)",
          rusqlite::params![pred_str, now_str],
        )?;
        for event in &events {
          event.insert(&tx)?;
        }

        tx.commit()?;
        Ok(WriteOutcome::Committed)
      })
      .await?;

    Self::map_outcome(outcome, listing_id, expected)
  }

  async fn replace_aggregation(&self, replacement: AggregateReplacement) -> Result<()> {
    let listing_id = replacement.aggregation.listing_id;
    let expected   = replacement.expected_revision;
    let now_str    = encode_dt(Utc::now());
    let aggregate  = EncodedAggregate::encode(&replacement.aggregation)?;
    let processed: Vec<String> =
      replacement.processed.iter().copied().map(encode_uuid).collect();
    let events = replacement
      .events
      .iter()
      .map(EncodedEvent::encode)
      .collect::<Result<Vec<_>>>()?;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Err(found) = aggregate.write_guarded(&tx, expected)? {
          return Ok(WriteOutcome::Conflict { found });
        }

        for id in &processed {
          tx.execute(
            "INSERT INTO processed_predictions (prediction_id, processed_at) VALUES (?1, ?2)
             ON CONFLICT(prediction_id) DO NOTHING",
            rusqlite::params![id, now_str],
          )?;
        }
        for event in &events {
          event.insert(&tx)?;
        }

        tx.commit()?;
        Ok(WriteOutcome::Committed)
      })
      .await?;

    Self::map_outcome(outcome, listing_id, expected)
  }

  async fn stale_aggregations(&self, version: u32) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT listing_id FROM aggregations WHERE calculation_version != ?1
           ORDER BY listing_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![version], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    ids.iter().map(|s| decode_uuid(s)).collect()
  }

  // ── Change events ─────────────────────────────────────────────────────────

  async fn list_change_events<'a>(
    &'a self,
    query: &'a ChangeQuery,
  ) -> Result<Vec<TemporalChangeEvent>> {
    let listing_str = query.listing_id.map(encode_uuid);
    let flagged     = query.flagged_only;
    let kind_str    = query.change_type.map(|k| k.to_string());
    let limit_val   = query.limit.map_or(-1, |l| l as i64);

    let raws: Vec<EncodedEvent> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT
             event_id, listing_id, current_image_id, current_prediction_id,
             previous_image_id, previous_prediction_id, change_type, direction,
             magnitude, detail_json, time_delta_secs, detected_at,
             model_version, flagged_for_review
           FROM change_events
           WHERE (?1 IS NULL OR listing_id = ?1)
             AND (?2 = 0 OR flagged_for_review = 1)
             AND (?3 IS NULL OR change_type = ?3)
           ORDER BY detected_at DESC, rowid DESC
           LIMIT ?4",
        )?;
        let rows = stmt
          .query_map(
            rusqlite::params![listing_str, flagged, kind_str, limit_val],
            EncodedEvent::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(EncodedEvent::into_event).collect()
  }

  // ── Drift ─────────────────────────────────────────────────────────────────

  async fn put_baseline(&self, baseline: DriftBaseline) -> Result<()> {
    let distribution_json = serde_json::to_string(&baseline.distribution)?;
    let metric_name       = baseline.metric.to_string();
    let captured_str      = encode_dt(baseline.captured_at);
    let model_version     = baseline.model_version;

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO drift_baselines (model_version, metric_name, distribution_json, captured_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(model_version, metric_name) DO UPDATE SET
             distribution_json = excluded.distribution_json,
             captured_at       = excluded.captured_at",
          rusqlite::params![model_version, metric_name, distribution_json, captured_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_baseline(
    &self,
    model_version: String,
    metric:        DriftMetric,
  ) -> Result<Option<DriftBaseline>> {
    let metric_name = metric.to_string();
    let raw: Option<RawBaseline> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT model_version, metric_name, distribution_json, captured_at
               FROM drift_baselines WHERE model_version = ?1 AND metric_name = ?2",
              rusqlite::params![model_version, metric_name],
              |row| {
                Ok(RawBaseline {
                  model_version:     row.get(0)?,
                  metric_name:       row.get(1)?,
                  distribution_json: row.get(2)?,
                  captured_at:       row.get(3)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawBaseline::into_baseline).transpose()
  }

  async fn upsert_drift_record(&self, record: DriftRecord) -> Result<DriftRecord> {
    let r = EncodedDrift::encode(&record);

    let stored: EncodedDrift = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO drift_records (
             drift_id, model_version, metric_name, drift_test,
             baseline_mean, baseline_std, current_mean, current_std,
             drift_score, drift_magnitude, status, alert_sent, threshold,
             min_sample_size, sample_size, window_start, window_end, evaluated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
           ON CONFLICT(model_version, metric_name, window_start, window_end) DO UPDATE SET
             drift_test      = excluded.drift_test,
             baseline_mean   = excluded.baseline_mean,
             baseline_std    = excluded.baseline_std,
             current_mean    = excluded.current_mean,
             current_std     = excluded.current_std,
             drift_score     = excluded.drift_score,
             drift_magnitude = excluded.drift_magnitude,
             status          = excluded.status,
             alert_sent      = drift_records.alert_sent OR excluded.alert_sent,
             threshold       = excluded.threshold,
             min_sample_size = excluded.min_sample_size,
             sample_size     = excluded.sample_size,
             evaluated_at    = excluded.evaluated_at",
          rusqlite::params![
            r.drift_id,
            r.model_version,
            r.metric_name,
            r.drift_test,
            r.baseline_mean,
            r.baseline_std,
            r.current_mean,
            r.current_std,
            r.drift_score,
            r.drift_magnitude,
            r.status,
            r.alert_sent,
            r.threshold,
            r.min_sample_size,
            r.sample_size,
            r.window_start,
            r.window_end,
            r.evaluated_at,
          ],
        )?;

        let sql = format!(
          "SELECT {DRIFT_COLUMNS} FROM drift_records
           WHERE model_version = ?1 AND metric_name = ?2
             AND window_start = ?3 AND window_end = ?4"
        );
        Ok(conn.query_row(
          &sql,
          rusqlite::params![r.model_version, r.metric_name, r.window_start, r.window_end],
          EncodedDrift::from_row,
        )?)
      })
      .await?;

    stored.into_record()
  }

  async fn mark_alert_sent(&self, drift_id: Uuid) -> Result<()> {
    let id_str = encode_uuid(drift_id);
    let updated = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE drift_records SET alert_sent = 1 WHERE drift_id = ?1",
          rusqlite::params![id_str],
        )?)
      })
      .await?;

    if updated == 0 {
      return Err(Error::DriftRecordNotFound(drift_id));
    }
    Ok(())
  }

  async fn pending_alerts(&self) -> Result<Vec<DriftRecord>> {
    let drifted = DriftStatus::Drifted.to_string();
    let raws: Vec<EncodedDrift> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {DRIFT_COLUMNS} FROM drift_records
           WHERE status = ?1 AND alert_sent = 0
           ORDER BY window_end, rowid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params![drifted], EncodedDrift::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(EncodedDrift::into_record).collect()
  }

  async fn list_drift_records<'a>(
    &'a self,
    query: &'a DriftQuery,
  ) -> Result<Vec<DriftRecord>> {
    let model_version = query.model_version.clone();
    let metric_name   = query.metric.map(|m| m.to_string());
    let drifted       = query.detected_only.then(|| DriftStatus::Drifted.to_string());
    let limit_val     = query.limit.map_or(-1, |l| l as i64);

    let raws: Vec<EncodedDrift> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {DRIFT_COLUMNS} FROM drift_records
           WHERE (?1 IS NULL OR model_version = ?1)
             AND (?2 IS NULL OR metric_name = ?2)
             AND (?3 IS NULL OR status = ?3)
           ORDER BY window_end DESC, rowid DESC
           LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(
            rusqlite::params![model_version, metric_name, drifted, limit_val],
            EncodedDrift::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(EncodedDrift::into_record).collect()
  }
}
