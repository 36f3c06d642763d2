//! DDL for the intelligence store, applied on every open.
//!
//! `PRAGMA user_version` records the schema revision.

/// Every statement is `IF NOT EXISTS`, so re-applying is a no-op.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS listings (
    listing_id  TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL
);

-- Predictions are strictly append-only.
-- No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS predictions (
    sequence      INTEGER PRIMARY KEY AUTOINCREMENT,  -- ingestion order
    prediction_id TEXT NOT NULL UNIQUE,
    image_id      TEXT NOT NULL,
    listing_id    TEXT NOT NULL REFERENCES listings(listing_id),
    model_version TEXT NOT NULL,
    captured_at   TEXT NOT NULL,   -- fixed-width RFC 3339 UTC
    recorded_at   TEXT NOT NULL,   -- server-assigned
    room_type     TEXT,            -- copied out of outputs_json for indexing
    outputs_json  TEXT NOT NULL
);

-- Point lookup for the most recent prior observation.
CREATE INDEX IF NOT EXISTS predictions_prior_idx
    ON predictions(listing_id, captured_at DESC, sequence DESC);
CREATE INDEX IF NOT EXISTS predictions_room_idx
    ON predictions(listing_id, room_type, captured_at DESC, sequence DESC);
CREATE INDEX IF NOT EXISTS predictions_image_idx
    ON predictions(image_id, sequence);
CREATE INDEX IF NOT EXISTS predictions_model_idx
    ON predictions(model_version, captured_at);

-- At-most-once marker: a prediction folded into its aggregate.
CREATE TABLE IF NOT EXISTS processed_predictions (
    prediction_id TEXT PRIMARY KEY REFERENCES predictions(prediction_id),
    processed_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS aggregations (
    listing_id          TEXT PRIMARY KEY REFERENCES listings(listing_id),
    revision            INTEGER NOT NULL,
    calculation_version INTEGER NOT NULL,
    total_images        INTEGER NOT NULL,
    last_calculated_at  TEXT NOT NULL,
    state_json          TEXT NOT NULL   -- full PropertyAggregation
);

-- Change events are append-only.
CREATE TABLE IF NOT EXISTS change_events (
    event_id               TEXT PRIMARY KEY,
    listing_id             TEXT NOT NULL REFERENCES listings(listing_id),
    current_image_id       TEXT NOT NULL,
    current_prediction_id  TEXT NOT NULL REFERENCES predictions(prediction_id),
    previous_image_id      TEXT NOT NULL,
    previous_prediction_id TEXT NOT NULL REFERENCES predictions(prediction_id),
    change_type            TEXT NOT NULL,   -- 'condition' | 'light' | 'feature_set' | 'style'
    direction              TEXT NOT NULL,   -- 'improved' | 'degraded' | 'stable'
    magnitude              REAL,
    detail_json            TEXT NOT NULL,
    time_delta_secs        INTEGER NOT NULL,
    detected_at            TEXT NOT NULL,
    model_version          TEXT NOT NULL,
    flagged_for_review     INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS change_events_listing_idx
    ON change_events(listing_id, detected_at);
CREATE INDEX IF NOT EXISTS change_events_flagged_idx
    ON change_events(flagged_for_review, detected_at);

CREATE TABLE IF NOT EXISTS drift_baselines (
    model_version     TEXT NOT NULL,
    metric_name       TEXT NOT NULL,
    distribution_json TEXT NOT NULL,
    captured_at       TEXT NOT NULL,
    PRIMARY KEY (model_version, metric_name)
);

CREATE TABLE IF NOT EXISTS drift_records (
    drift_id        TEXT PRIMARY KEY,
    model_version   TEXT NOT NULL,
    metric_name     TEXT NOT NULL,
    drift_test      TEXT NOT NULL,   -- 'ks'
    baseline_mean   REAL,
    baseline_std    REAL,
    current_mean    REAL,
    current_std     REAL,
    drift_score     REAL,
    drift_magnitude REAL,
    status          TEXT NOT NULL,   -- 'stable' | 'drifted' | 'insufficient_data'
    alert_sent      INTEGER NOT NULL DEFAULT 0,
    threshold       REAL NOT NULL,
    min_sample_size INTEGER NOT NULL,
    sample_size     INTEGER NOT NULL,
    window_start    TEXT NOT NULL,
    window_end      TEXT NOT NULL,
    evaluated_at    TEXT NOT NULL,
    UNIQUE (model_version, metric_name, window_start, window_end),
    CHECK  (window_end > window_start),
    CHECK  (status != 'drifted' OR sample_size > 0)
);

CREATE INDEX IF NOT EXISTS drift_records_pending_idx
    ON drift_records(status, alert_sent);

PRAGMA user_version = 1;
";
