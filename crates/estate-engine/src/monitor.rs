//! The Drift Monitor: a pull-based batch job, independent of ingestion.
//!
//! Each evaluation scores one `(model_version, metric, window)` against the
//! stored baseline with the Kolmogorov–Smirnov statistic and upserts one
//! [`DriftRecord`]. Alert delivery for drifted windows is spawned onto the
//! runtime so a slow or failing sink never holds up the next evaluation;
//! undelivered alerts stay pending in the store for
//! [`DriftMonitor::resend_pending_alerts`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use estate_core::{
  drift::{
    BaselineDistribution, DriftBaseline, DriftCriteria, DriftMetric, DriftRecord,
    DriftStatus, DriftWindow, assess,
  },
  store::IntelligenceStore,
};
use tokio::{
  sync::{Mutex, watch},
  task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
  AlertSink, DriftAlert, EngineConfig, Error, Result,
  config::{DriftConfig, RetryConfig},
  retry::{Backoff, with_retry},
};

/// One unit of batch work.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftJob {
  pub model_version: String,
  pub metric:        DriftMetric,
  pub window:        DriftWindow,
}

#[derive(Debug, Default)]
pub struct BatchReport {
  pub records:     Vec<DriftRecord>,
  pub failed:      Vec<DriftJob>,
  /// Stopped early on shutdown.
  pub interrupted: bool,
}

impl BatchReport {
  pub fn drifted(&self) -> usize {
    self.records.iter().filter(|r| r.drift_detected()).count()
  }
}

pub struct DriftMonitor<S, K> {
  store:      Arc<S>,
  sink:       Arc<K>,
  config:     DriftConfig,
  retry:      RetryConfig,
  deliveries: Mutex<JoinSet<()>>,
}

impl<S, K> DriftMonitor<S, K>
where
  S: IntelligenceStore + 'static,
  K: AlertSink,
{
  pub fn new(store: Arc<S>, sink: Arc<K>, config: &EngineConfig) -> Self {
    Self {
      store,
      sink,
      config: config.drift.clone(),
      retry: config.retry.clone(),
      deliveries: Mutex::new(JoinSet::new()),
    }
  }

  pub fn criteria(&self) -> DriftCriteria {
    DriftCriteria {
      threshold:       self.config.threshold,
      min_sample_size: self.config.min_sample_size,
    }
  }

  /// Evaluate the half-open window `[start, end)`.
  pub async fn evaluate(
    &self,
    model_version: &str,
    metric: DriftMetric,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<DriftRecord> {
    let window = DriftWindow::new(start, end)?;
    self.evaluate_window(model_version, metric, window).await
  }

  pub async fn evaluate_window(
    &self,
    model_version: &str,
    metric: DriftMetric,
    window: DriftWindow,
  ) -> Result<DriftRecord> {
    let baseline = self
      .load_baseline(model_version, metric)
      .await?
      .ok_or_else(|| Error::BaselineNotFound {
        model_version: model_version.to_owned(),
        metric,
      })?;

    let samples = self.samples(model_version, metric, window).await?;
    let record = assess(&baseline, &samples, window, self.criteria(), Utc::now());

    let stored = with_retry(&self.retry, "drift upsert", || {
      self.store.upsert_drift_record(record.clone())
    })
    .await
    .map_err(Error::store)?;

    match stored.status {
      DriftStatus::Drifted => info!(
        %model_version,
        %metric,
        drift_score = ?stored.drift_score,
        sample_size = stored.sample_size,
        alert_sent = stored.alert_sent,
        "drift detected"
      ),
      DriftStatus::Stable | DriftStatus::InsufficientData => debug!(
        %model_version,
        %metric,
        status = %stored.status,
        drift_score = ?stored.drift_score,
        sample_size = stored.sample_size,
        "drift evaluated"
      ),
    }

    if stored.alert_pending() {
      self.dispatch(&stored).await;
    }
    Ok(stored)
  }

  /// Store the window's samples as the empirical baseline for
  /// `(model_version, metric)`, replacing any existing one.
  pub async fn capture_baseline(
    &self,
    model_version: &str,
    metric: DriftMetric,
    window: DriftWindow,
  ) -> Result<DriftBaseline> {
    let samples = self.samples(model_version, metric, window).await?;
    if samples.is_empty() {
      return Err(Error::validation(format!(
        "no {metric} samples for model {model_version:?} in the baseline window"
      )));
    }

    let baseline = DriftBaseline {
      model_version: model_version.to_owned(),
      metric,
      distribution: BaselineDistribution::empirical(samples),
      captured_at: Utc::now(),
    };
    with_retry(&self.retry, "baseline write", || {
      self.store.put_baseline(baseline.clone())
    })
    .await
    .map_err(Error::store)?;

    info!(%model_version, %metric, "drift baseline captured");
    Ok(baseline)
  }

  /// Jobs for every known model version and configured metric over the
  /// window ending at `end`.
  pub async fn plan(&self, end: DateTime<Utc>) -> Result<Vec<DriftJob>> {
    let window = DriftWindow::new(end - self.config.window(), end)?;
    let versions = with_retry(&self.retry, "model versions", || {
      self.store.model_versions()
    })
    .await
    .map_err(Error::store)?;

    Ok(
      versions
        .iter()
        .flat_map(|v| {
          self.config.metrics.iter().map(move |&metric| DriftJob {
            model_version: v.clone(),
            metric,
            window,
          })
        })
        .collect(),
    )
  }

  /// Evaluate `jobs` in order, checking `shutdown` between jobs. A failed
  /// job is logged and skipped.
  pub async fn run_batch(
    &self,
    jobs: Vec<DriftJob>,
    shutdown: &watch::Receiver<bool>,
  ) -> BatchReport {
    let mut report = BatchReport::default();
    let total = jobs.len();

    for (done, job) in jobs.into_iter().enumerate() {
      if *shutdown.borrow() {
        info!(done, total, "shutdown requested; stopping drift batch");
        report.interrupted = true;
        break;
      }
      match self
        .evaluate_window(&job.model_version, job.metric, job.window)
        .await
      {
        Ok(record) => report.records.push(record),
        Err(e) => {
          warn!(
            model_version = %job.model_version,
            metric = %job.metric,
            error = %e,
            "drift evaluation failed"
          );
          report.failed.push(job);
        }
      }
    }
    report
  }

  /// Deliver every drifted record whose alert is still pending. Awaits each
  /// delivery; returns how many went through.
  pub async fn resend_pending_alerts(&self) -> Result<usize> {
    let pending = with_retry(&self.retry, "pending alerts", || {
      self.store.pending_alerts()
    })
    .await
    .map_err(Error::store)?;

    let mut delivered = 0;
    for record in &pending {
      match deliver(&*self.store, &*self.sink, &self.retry, DriftAlert::from(record)).await {
        Ok(()) => delivered += 1,
        Err(e) => warn!(drift_id = %record.drift_id, error = %e, "alert left pending"),
      }
    }
    info!(pending = pending.len(), delivered, "alert retry pass finished");
    Ok(delivered)
  }

  /// Wait for every spawned delivery to finish.
  pub async fn flush_alerts(&self) {
    let mut set = std::mem::take(&mut *self.deliveries.lock().await);
    while let Some(joined) = set.join_next().await {
      if let Err(e) = joined {
        warn!(error = %e, "alert delivery task failed");
      }
    }
  }

  async fn load_baseline(
    &self,
    model_version: &str,
    metric: DriftMetric,
  ) -> Result<Option<DriftBaseline>> {
    with_retry(&self.retry, "baseline read", || {
      self.store.get_baseline(model_version.to_owned(), metric)
    })
    .await
    .map_err(Error::store)
  }

  async fn samples(
    &self,
    model_version: &str,
    metric: DriftMetric,
    window: DriftWindow,
  ) -> Result<Vec<f64>> {
    let records = with_retry(&self.retry, "window read", || {
      self.store.predictions_in_window(model_version.to_owned(), window)
    })
    .await
    .map_err(Error::store)?;

    Ok(records.iter().filter_map(|r| metric.sample(r)).collect())
  }

  async fn dispatch(&self, record: &DriftRecord) {
    let store = Arc::clone(&self.store);
    let sink = Arc::clone(&self.sink);
    let retry = self.retry.clone();
    let alert = DriftAlert::from(record);
    let drift_id = record.drift_id;

    let mut deliveries = self.deliveries.lock().await;
    while deliveries.try_join_next().is_some() {}
    deliveries.spawn(async move {
      if let Err(e) = deliver(&*store, &*sink, &retry, alert).await {
        warn!(%drift_id, error = %e, "alert left pending");
      }
    });
  }
}

/// Send `alert` with backoff, then record the delivery.
async fn deliver<S, K>(
  store: &S,
  sink: &K,
  retry: &RetryConfig,
  alert: DriftAlert,
) -> Result<()>
where
  S: IntelligenceStore,
  K: AlertSink,
{
  let mut backoff = Backoff::new(retry);
  let mut attempt = 1;
  loop {
    match sink.send(&alert).await {
      Ok(()) => break,
      Err(e) if attempt < retry.max_attempts => {
        warn!(drift_id = %alert.drift_id, attempt, error = %e, "alert delivery failed; retrying");
        backoff.wait().await;
      }
      Err(e) => return Err(e.into()),
    }
    attempt += 1;
  }

  let drift_id = alert.drift_id;
  with_retry(retry, "mark alert sent", move || store.mark_alert_sent(drift_id))
    .await
    .map_err(Error::store)?;

  info!(
    %drift_id,
    model_version = %alert.model_version,
    metric = %alert.metric_name,
    "drift alert delivered"
  );
  Ok(())
}
