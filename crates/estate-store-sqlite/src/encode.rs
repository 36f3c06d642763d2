//! Column codecs and raw row types.
//!
//! Timestamps are fixed-width RFC 3339 (nanoseconds, `Z` suffix) so string
//! comparison in SQL matches chronological order. Head outputs, aggregate
//! state, change details and baselines are JSON. UUIDs are hyphenated.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use estate_core::{
  aggregation::PropertyAggregation,
  change::{ChangeDetail, TemporalChangeEvent},
  drift::{BaselineDistribution, DriftBaseline, DriftRecord, DriftWindow},
  listing::Listing,
  prediction::{ModelOutputs, PredictionRecord},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Enum discriminants ──────────────────────────────────────────────────────

/// Parse a `strum`-backed discriminant column.
pub fn decode_enum<T: FromStr>(column: &str, s: &str) -> Result<T> {
  s.parse()
    .map_err(|_| Error::Decode(format!("unknown {column}: {s:?}")))
}

// ─── Counters ────────────────────────────────────────────────────────────────

pub fn encode_count(n: u64) -> i64 { i64::try_from(n).unwrap_or(i64::MAX) }

pub fn decode_count(n: i64) -> u64 { u64::try_from(n).unwrap_or(0) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column list shared by every prediction query, in `RawPrediction` order.
pub const PREDICTION_COLUMNS: &str = "p.sequence, p.prediction_id, p.image_id, \
   p.listing_id, p.model_version, p.captured_at, p.recorded_at, p.outputs_json";

/// Raw values read directly from a `predictions` row.
pub struct RawPrediction {
  pub sequence:      i64,
  pub prediction_id: String,
  pub image_id:      String,
  pub listing_id:    String,
  pub model_version: String,
  pub captured_at:   String,
  pub recorded_at:   String,
  pub outputs_json:  String,
}

impl RawPrediction {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sequence:      row.get(0)?,
      prediction_id: row.get(1)?,
      image_id:      row.get(2)?,
      listing_id:    row.get(3)?,
      model_version: row.get(4)?,
      captured_at:   row.get(5)?,
      recorded_at:   row.get(6)?,
      outputs_json:  row.get(7)?,
    })
  }

  pub fn into_record(self) -> Result<PredictionRecord> {
    let outputs: ModelOutputs = serde_json::from_str(&self.outputs_json)?;
    Ok(PredictionRecord {
      prediction_id: decode_uuid(&self.prediction_id)?,
      sequence:      self.sequence,
      image_id:      decode_uuid(&self.image_id)?,
      listing_id:    decode_uuid(&self.listing_id)?,
      model_version: self.model_version,
      captured_at:   decode_dt(&self.captured_at)?,
      recorded_at:   decode_dt(&self.recorded_at)?,
      outputs,
    })
  }
}

pub struct RawListing {
  pub listing_id: String,
  pub created_at: String,
}

impl RawListing {
  pub fn into_listing(self) -> Result<Listing> {
    Ok(Listing {
      listing_id: decode_uuid(&self.listing_id)?,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}

pub fn decode_aggregation(state_json: &str) -> Result<PropertyAggregation> {
  Ok(serde_json::from_str(state_json)?)
}

/// Column values for one `change_events` insert.
pub struct EncodedEvent {
  pub event_id:               String,
  pub listing_id:             String,
  pub current_image_id:       String,
  pub current_prediction_id:  String,
  pub previous_image_id:      String,
  pub previous_prediction_id: String,
  pub change_type:            String,
  pub direction:              String,
  pub magnitude:              Option<f64>,
  pub detail_json:            String,
  pub time_delta_secs:        i64,
  pub detected_at:            String,
  pub model_version:          String,
  pub flagged_for_review:     bool,
}

impl EncodedEvent {
  pub fn encode(event: &TemporalChangeEvent) -> Result<Self> {
    Ok(Self {
      event_id:               encode_uuid(event.event_id),
      listing_id:             encode_uuid(event.listing_id),
      current_image_id:       encode_uuid(event.current_image_id),
      current_prediction_id:  encode_uuid(event.current_prediction_id),
      previous_image_id:      encode_uuid(event.previous_image_id),
      previous_prediction_id: encode_uuid(event.previous_prediction_id),
      change_type:            event.change_type.to_string(),
      direction:              event.direction.to_string(),
      magnitude:              event.magnitude,
      detail_json:            serde_json::to_string(&event.detail)?,
      time_delta_secs:        event.time_delta_secs,
      detected_at:            encode_dt(event.detected_at),
      model_version:          event.model_version.clone(),
      flagged_for_review:     event.flagged_for_review,
    })
  }

  pub fn insert(&self, tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute(
      "INSERT INTO change_events (
         event_id, listing_id, current_image_id, current_prediction_id,
         previous_image_id, previous_prediction_id, change_type, direction,
         magnitude, detail_json, time_delta_secs, detected_at,
         model_version, flagged_for_review
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
      rusqlite::params![
        self.event_id,
        self.listing_id,
        self.current_image_id,
        self.current_prediction_id,
        self.previous_image_id,
        self.previous_prediction_id,
        self.change_type,
        self.direction,
        self.magnitude,
        self.detail_json,
        self.time_delta_secs,
        self.detected_at,
        self.model_version,
        self.flagged_for_review,
      ],
    )?;
    Ok(())
  }

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:               row.get(0)?,
      listing_id:             row.get(1)?,
      current_image_id:       row.get(2)?,
      current_prediction_id:  row.get(3)?,
      previous_image_id:      row.get(4)?,
      previous_prediction_id: row.get(5)?,
      change_type:            row.get(6)?,
      direction:              row.get(7)?,
      magnitude:              row.get(8)?,
      detail_json:            row.get(9)?,
      time_delta_secs:        row.get(10)?,
      detected_at:            row.get(11)?,
      model_version:          row.get(12)?,
      flagged_for_review:     row.get(13)?,
    })
  }

  pub fn into_event(self) -> Result<TemporalChangeEvent> {
    let detail: ChangeDetail = serde_json::from_str(&self.detail_json)?;
    Ok(TemporalChangeEvent {
      event_id:               decode_uuid(&self.event_id)?,
      listing_id:             decode_uuid(&self.listing_id)?,
      current_image_id:       decode_uuid(&self.current_image_id)?,
      current_prediction_id:  decode_uuid(&self.current_prediction_id)?,
      previous_image_id:      decode_uuid(&self.previous_image_id)?,
      previous_prediction_id: decode_uuid(&self.previous_prediction_id)?,
      change_type:            decode_enum("change_type", &self.change_type)?,
      direction:              decode_enum("direction", &self.direction)?,
      magnitude:              self.magnitude,
      detail,
      time_delta_secs:        self.time_delta_secs,
      detected_at:            decode_dt(&self.detected_at)?,
      model_version:          self.model_version,
      flagged_for_review:     self.flagged_for_review,
    })
  }
}

pub struct RawBaseline {
  pub model_version:     String,
  pub metric_name:       String,
  pub distribution_json: String,
  pub captured_at:       String,
}

impl RawBaseline {
  pub fn into_baseline(self) -> Result<DriftBaseline> {
    let distribution: BaselineDistribution =
      serde_json::from_str(&self.distribution_json)?;
    Ok(DriftBaseline {
      model_version: self.model_version,
      metric:        decode_enum("metric_name", &self.metric_name)?,
      distribution,
      captured_at:   decode_dt(&self.captured_at)?,
    })
  }
}

/// Column list shared by every drift-record query, in `EncodedDrift` order.
pub const DRIFT_COLUMNS: &str = "drift_id, model_version, metric_name, \
   drift_test, baseline_mean, baseline_std, current_mean, current_std, \
   drift_score, drift_magnitude, status, alert_sent, threshold, \
   min_sample_size, sample_size, window_start, window_end, evaluated_at";

/// Column values of one `drift_records` row.
pub struct EncodedDrift {
  pub drift_id:        String,
  pub model_version:   String,
  pub metric_name:     String,
  pub drift_test:      String,
  pub baseline_mean:   Option<f64>,
  pub baseline_std:    Option<f64>,
  pub current_mean:    Option<f64>,
  pub current_std:     Option<f64>,
  pub drift_score:     Option<f64>,
  pub drift_magnitude: Option<f64>,
  pub status:          String,
  pub alert_sent:      bool,
  pub threshold:       f64,
  pub min_sample_size: i64,
  pub sample_size:     i64,
  pub window_start:    String,
  pub window_end:      String,
  pub evaluated_at:    String,
}

impl EncodedDrift {
  pub fn encode(r: &DriftRecord) -> Self {
    Self {
      drift_id:        encode_uuid(r.drift_id),
      model_version:   r.model_version.clone(),
      metric_name:     r.metric.to_string(),
      drift_test:      r.drift_test.to_string(),
      baseline_mean:   r.baseline_mean,
      baseline_std:    r.baseline_std,
      current_mean:    r.current_mean,
      current_std:     r.current_std,
      drift_score:     r.drift_score,
      drift_magnitude: r.drift_magnitude,
      status:          r.status.to_string(),
      alert_sent:      r.alert_sent,
      threshold:       r.threshold,
      min_sample_size: encode_count(r.min_sample_size),
      sample_size:     encode_count(r.sample_size),
      window_start:    encode_dt(r.window.start),
      window_end:      encode_dt(r.window.end),
      evaluated_at:    encode_dt(r.evaluated_at),
    }
  }

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      drift_id:        row.get(0)?,
      model_version:   row.get(1)?,
      metric_name:     row.get(2)?,
      drift_test:      row.get(3)?,
      baseline_mean:   row.get(4)?,
      baseline_std:    row.get(5)?,
      current_mean:    row.get(6)?,
      current_std:     row.get(7)?,
      drift_score:     row.get(8)?,
      drift_magnitude: row.get(9)?,
      status:          row.get(10)?,
      alert_sent:      row.get(11)?,
      threshold:       row.get(12)?,
      min_sample_size: row.get(13)?,
      sample_size:     row.get(14)?,
      window_start:    row.get(15)?,
      window_end:      row.get(16)?,
      evaluated_at:    row.get(17)?,
    })
  }

  pub fn into_record(self) -> Result<DriftRecord> {
    Ok(DriftRecord {
      drift_id:        decode_uuid(&self.drift_id)?,
      model_version:   self.model_version,
      metric:          decode_enum("metric_name", &self.metric_name)?,
      drift_test:      decode_enum("drift_test", &self.drift_test)?,
      baseline_mean:   self.baseline_mean,
      baseline_std:    self.baseline_std,
      current_mean:    self.current_mean,
      current_std:     self.current_std,
      drift_score:     self.drift_score,
      drift_magnitude: self.drift_magnitude,
      status:          decode_enum("status", &self.status)?,
      alert_sent:      self.alert_sent,
      threshold:       self.threshold,
      min_sample_size: decode_count(self.min_sample_size),
      sample_size:     decode_count(self.sample_size),
      window:          DriftWindow {
        start: decode_dt(&self.window_start)?,
        end:   decode_dt(&self.window_end)?,
      },
      evaluated_at:    decode_dt(&self.evaluated_at)?,
    })
  }
}
