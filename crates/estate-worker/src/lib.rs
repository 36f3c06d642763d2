//! Worker wiring: configuration loading, the alert sink choice and the
//! periodic drift loop.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context as _;
use chrono::{DurationRound as _, TimeDelta, Utc};
use estate_core::store::IntelligenceStore;
use estate_engine::{
  AlertSink, BatchReport, DriftAlert, DriftMonitor, EngineConfig, LogAlertSink,
  NotificationError, WebhookAlertSink,
};
use serde::Deserialize;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{info, warn};

// ─── Configuration ────────────────────────────────────────────────────────────

/// Top-level worker configuration, read from TOML and `ESTATE_*` variables.
///
/// Nested engine keys use `__` in the environment, e.g.
/// `ESTATE_ENGINE__DRIFT__THRESHOLD=0.3`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
  pub store_path:        PathBuf,
  /// POST alerts here; alerts are only logged when unset.
  #[serde(default)]
  pub alert_webhook_url: Option<String>,
  #[serde(default)]
  pub engine:            EngineConfig,
}

impl WorkerConfig {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("ESTATE")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read config file")?;
    Self::from_settings(settings)
  }

  fn from_settings(settings: config::Config) -> anyhow::Result<Self> {
    let config: Self = settings
      .try_deserialize()
      .context("failed to deserialise WorkerConfig")?;
    config
      .engine
      .validate()
      .context("invalid engine configuration")?;
    Ok(config)
  }
}

// ─── Alert sink ───────────────────────────────────────────────────────────────

/// The sink selected by configuration.
#[derive(Debug, Clone)]
pub enum WorkerSink {
  Log(LogAlertSink),
  Webhook(WebhookAlertSink),
}

impl WorkerSink {
  pub fn from_config(config: &WorkerConfig) -> Result<Self, NotificationError> {
    match &config.alert_webhook_url {
      Some(url) => Ok(Self::Webhook(WebhookAlertSink::new(url.clone())?)),
      None => Ok(Self::Log(LogAlertSink)),
    }
  }
}

impl AlertSink for WorkerSink {
  async fn send<'a>(&'a self, alert: &'a DriftAlert) -> Result<(), NotificationError> {
    match self {
      Self::Log(sink) => sink.send(alert).await,
      Self::Webhook(sink) => sink.send(alert).await,
    }
  }
}

// ─── Drift loop ───────────────────────────────────────────────────────────────

/// One scheduled pass: resend pending alerts, then evaluate every model
/// version and metric over the window ending at the current hour.
pub async fn drift_pass<S, K>(
  monitor: &DriftMonitor<S, K>,
  shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<BatchReport>
where
  S: IntelligenceStore + 'static,
  K: AlertSink,
{
  if let Err(e) = monitor.resend_pending_alerts().await {
    warn!(error = %e, "alert retry pass failed");
  }

  let end = Utc::now()
    .duration_trunc(TimeDelta::hours(1))
    .context("failed to align the drift window")?;
  let jobs = monitor.plan(end).await.context("failed to plan drift batch")?;
  let report = monitor.run_batch(jobs, shutdown).await;

  info!(
    window_end = %end,
    evaluated = report.records.len(),
    drifted = report.drifted(),
    failed = report.failed.len(),
    interrupted = report.interrupted,
    "drift batch finished"
  );
  Ok(report)
}

/// Run [`drift_pass`] every `interval` until `shutdown` flips, or once.
/// In-flight alert deliveries are awaited before returning.
pub async fn run_drift<S, K>(
  monitor: &DriftMonitor<S, K>,
  interval: Duration,
  once: bool,
  mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
  S: IntelligenceStore + 'static,
  K: AlertSink,
{
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = ticker.tick() => {}
      _ = shutdown.changed() => break,
    }
    if *shutdown.borrow() {
      break;
    }

    match drift_pass(monitor, &shutdown).await {
      Ok(report) if report.interrupted => break,
      Ok(_) => {}
      Err(e) => warn!(error = %format_args!("{e:#}"), "drift pass failed"),
    }
    if once {
      break;
    }
  }

  monitor.flush_alerts().await;
  info!("drift loop stopped");
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  match path.strip_prefix("~") {
    Ok(rest) => match std::env::var_os("HOME") {
      Some(home) => PathBuf::from(home).join(rest),
      None => path.to_path_buf(),
    },
    Err(_) => path.to_path_buf(),
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use config::{File, FileFormat};
  use estate_core::drift::DriftMetric;
  use estate_store_sqlite::SqliteStore;

  use super::*;

  fn settings(toml: &str) -> config::Config {
    config::Config::builder()
      .add_source(File::from_str(toml, FileFormat::Toml))
      .build()
      .unwrap()
  }

  #[test]
  fn partial_file_keeps_engine_defaults() {
    let config = WorkerConfig::from_settings(settings(
      r#"
        store_path = "/var/lib/estate/intel.db"

        [engine.drift]
        threshold = 0.3
        metrics   = ["condition_score", "style_confidence"]
      "#,
    ))
    .unwrap();

    assert_eq!(config.store_path, PathBuf::from("/var/lib/estate/intel.db"));
    assert!(config.alert_webhook_url.is_none());
    assert_eq!(config.engine.drift.threshold, 0.3);
    assert_eq!(
      config.engine.drift.metrics,
      vec![DriftMetric::ConditionScore, DriftMetric::StyleConfidence]
    );
    assert_eq!(config.engine.drift.min_sample_size, 30);
    assert_eq!(config.engine.aggregation.top_features, 10);
    assert_eq!(config.engine.retry.max_attempts, 5);
  }

  #[test]
  fn store_path_is_required() {
    assert!(WorkerConfig::from_settings(settings("")).is_err());
  }

  #[test]
  fn invalid_engine_settings_are_rejected() {
    let err = WorkerConfig::from_settings(settings(
      r#"
        store_path = "intel.db"

        [engine.aggregation]
        top_features     = 20
        feature_capacity = 8
      "#,
    ))
    .unwrap_err();
    assert!(format!("{err:#}").contains("feature_capacity"));
  }

  #[test]
  fn sink_follows_webhook_setting() {
    let mut config = WorkerConfig::from_settings(settings(r#"store_path = "intel.db""#)).unwrap();
    assert!(matches!(WorkerSink::from_config(&config).unwrap(), WorkerSink::Log(_)));

    config.alert_webhook_url = Some("http://127.0.0.1:9/alerts".into());
    assert!(matches!(WorkerSink::from_config(&config).unwrap(), WorkerSink::Webhook(_)));
  }

  #[test]
  fn tilde_expands_against_home() {
    let Some(home) = std::env::var_os("HOME") else { return };
    assert_eq!(
      expand_tilde(Path::new("~/estate/intel.db")),
      PathBuf::from(home).join("estate/intel.db")
    );
    assert_eq!(expand_tilde(Path::new("/tmp/intel.db")), PathBuf::from("/tmp/intel.db"));
  }

  #[tokio::test]
  async fn single_pass_on_an_empty_store() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let monitor = DriftMonitor::new(store, Arc::new(LogAlertSink), &EngineConfig::default());
    let (_tx, rx) = watch::channel(false);

    let report = drift_pass(&monitor, &rx).await.unwrap();
    assert!(report.records.is_empty());
    assert!(!report.interrupted);

    run_drift(&monitor, Duration::from_millis(5), true, rx).await.unwrap();
  }

  #[tokio::test]
  async fn loop_exits_when_shutdown_flips() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let monitor = DriftMonitor::new(store, Arc::new(LogAlertSink), &EngineConfig::default());
    let (tx, rx) = watch::channel(false);

    tx.send(true).unwrap();
    tokio::time::timeout(
      Duration::from_secs(5),
      run_drift(&monitor, Duration::from_secs(3600), false, rx),
    )
    .await
    .unwrap()
    .unwrap();
  }
}
