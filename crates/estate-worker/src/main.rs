//! estate-worker binary.
//!
//! Reads `config.toml` (or the path given with `--config`), opens the SQLite
//! intelligence store, and runs the periodic drift batch or a one-shot
//! maintenance command.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use estate_engine::{DriftMonitor, IngestPipeline};
use estate_store_sqlite::SqliteStore;
use estate_worker::{WorkerConfig, WorkerSink, expand_tilde, run_drift};
use tokio::sync::watch;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about = "Property intelligence worker")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Evaluate drift for every model version on the configured interval.
  Drift {
    /// Run a single batch and exit.
    #[arg(long)]
    once: bool,
  },
  /// Rebuild one listing's aggregate from its predictions.
  Recompute { listing_id: Uuid },
  /// Rebuild every aggregate computed with an older calculation version.
  RecomputeStale,
  /// Deliver drift alerts that are still pending.
  ResendAlerts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let config = WorkerConfig::load(&cli.config)?;

  let store_path = expand_tilde(&config.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let store = Arc::new(store);

  match cli.command {
    Command::Drift { once } => {
      let sink = WorkerSink::from_config(&config).context("failed to build alert sink")?;
      let monitor = DriftMonitor::new(store, Arc::new(sink), &config.engine);

      let (tx, rx) = watch::channel(false);
      let signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
          Ok(()) => {
            info!("shutdown requested");
            let _ = tx.send(true);
          }
          Err(e) => {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
          }
        }
      });

      info!(
        interval_secs = config.engine.drift.interval_secs,
        window_hours = config.engine.drift.window_hours,
        "drift loop starting"
      );
      let result = run_drift(&monitor, config.engine.drift.interval(), once, rx).await;
      signal.abort();
      result?;
    }

    Command::Recompute { listing_id } => {
      let pipeline = IngestPipeline::new(store, config.engine);
      let aggregation = pipeline
        .aggregator()
        .recompute(listing_id)
        .await
        .with_context(|| format!("failed to recompute listing {listing_id}"))?;
      info!(
        %listing_id,
        total_images = aggregation.total_images,
        revision = aggregation.revision,
        "aggregate rebuilt"
      );
    }

    Command::RecomputeStale => {
      let pipeline = IngestPipeline::new(store, config.engine);
      let rebuilt = pipeline
        .aggregator()
        .recompute_stale()
        .await
        .context("failed to recompute stale aggregates")?;
      info!(rebuilt = rebuilt.len(), "stale aggregates rebuilt");
    }

    Command::ResendAlerts => {
      let sink = WorkerSink::from_config(&config).context("failed to build alert sink")?;
      let monitor = DriftMonitor::new(store, Arc::new(sink), &config.engine);
      let delivered = monitor
        .resend_pending_alerts()
        .await
        .context("failed to resend pending alerts")?;
      info!(delivered, "pending alerts resent");
    }
  }

  Ok(())
}
