//! Alert sinks: where drifted windows are reported.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use estate_core::drift::{DriftMetric, DriftRecord};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// The payload handed to an [`AlertSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftAlert {
  pub drift_id:      Uuid,
  pub model_version: String,
  pub metric_name:   DriftMetric,
  pub drift_score:   f64,
  pub window_start:  DateTime<Utc>,
  pub window_end:    DateTime<Utc>,
}

impl From<&DriftRecord> for DriftAlert {
  fn from(r: &DriftRecord) -> Self {
    Self {
      drift_id:      r.drift_id,
      model_version: r.model_version.clone(),
      metric_name:   r.metric,
      drift_score:   r.drift_score.unwrap_or_default(),
      window_start:  r.window.start,
      window_end:    r.window.end,
    }
  }
}

#[derive(Debug, Error)]
pub enum NotificationError {
  #[error("alert sink unreachable: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("alert sink rejected the alert with status {0}")]
  Rejected(u16),

  #[error("alert sink unavailable: {0}")]
  Unavailable(String),
}

/// Accepts an alert and reports success or failure. Retrying is the caller's
/// job.
pub trait AlertSink: Send + Sync + 'static {
  fn send<'a>(
    &'a self,
    alert: &'a DriftAlert,
  ) -> impl Future<Output = Result<(), NotificationError>> + Send + 'a;
}

// ─── Log ─────────────────────────────────────────────────────────────────────

/// Reports each alert as a `warn!` event. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
  async fn send<'a>(&'a self, alert: &'a DriftAlert) -> Result<(), NotificationError> {
    warn!(
      drift_id = %alert.drift_id,
      model_version = %alert.model_version,
      metric = %alert.metric_name,
      drift_score = alert.drift_score,
      window_start = %alert.window_start,
      window_end = %alert.window_end,
      "model drift detected"
    );
    Ok(())
  }
}

// ─── Webhook ─────────────────────────────────────────────────────────────────

/// POSTs each alert as JSON. Any non-2xx response is a failure.
///
/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
  client: Client,
  url:    String,
}

impl WebhookAlertSink {
  pub fn new(url: impl Into<String>) -> Result<Self, NotificationError> {
    let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
    Ok(Self { client, url: url.into() })
  }
}

impl AlertSink for WebhookAlertSink {
  async fn send<'a>(&'a self, alert: &'a DriftAlert) -> Result<(), NotificationError> {
    let resp = self.client.post(&self.url).json(alert).send().await?;
    if !resp.status().is_success() {
      return Err(NotificationError::Rejected(resp.status().as_u16()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
  };

  use super::*;

  fn alert() -> DriftAlert {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    DriftAlert {
      drift_id:      Uuid::nil(),
      model_version: "v3".into(),
      metric_name:   DriftMetric::ConditionGoodRatio,
      drift_score:   0.42,
      window_start:  start,
      window_end:    start + chrono::Duration::hours(24),
    }
  }

  /// Serve a single request with `status_line`, returning the URL and the
  /// request body once it has been read.
  async fn serve_once(status_line: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/alerts", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = Vec::new();
      let mut chunk = [0u8; 1024];
      let body_start = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
          break i + 4;
        }
      };
      let headers = String::from_utf8_lossy(&buf[..body_start]).to_ascii_lowercase();
      let length: usize = headers
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .map_or(0, |v| v.trim().parse().unwrap());
      while buf.len() < body_start + length {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before body");
        buf.extend_from_slice(&chunk[..n]);
      }

      let response =
        format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
      socket.write_all(response.as_bytes()).await.unwrap();
      let _ = socket.shutdown().await;
      String::from_utf8(buf[body_start..].to_vec()).unwrap()
    });
    (url, handle)
  }

  #[test]
  fn alert_serialises_metric_by_name() {
    let json = serde_json::to_value(alert()).unwrap();
    assert_eq!(json["metric_name"], "condition_good_ratio");
    assert_eq!(json["model_version"], "v3");
  }

  #[tokio::test]
  async fn webhook_accepts_2xx() {
    let (url, server) = serve_once("200 OK").await;
    let sink = WebhookAlertSink::new(url).unwrap();

    sink.send(&alert()).await.unwrap();

    let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
    assert_eq!(body["metric_name"], "condition_good_ratio");
    assert_eq!(body["drift_score"], 0.42);
  }

  #[tokio::test]
  async fn webhook_reports_non_2xx_as_rejected() {
    let (url, server) = serve_once("500 Internal Server Error").await;
    let sink = WebhookAlertSink::new(url).unwrap();

    let err = sink.send(&alert()).await.unwrap_err();
    assert!(matches!(err, NotificationError::Rejected(500)));
    server.await.unwrap();
  }

  #[tokio::test]
  async fn webhook_reports_unreachable_sink_as_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/alerts", listener.local_addr().unwrap());
    drop(listener);

    let sink = WebhookAlertSink::new(url).unwrap();
    let err = sink.send(&alert()).await.unwrap_err();
    assert!(matches!(err, NotificationError::Transport(_)));
  }
}
