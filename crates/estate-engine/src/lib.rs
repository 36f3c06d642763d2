//! Orchestration for the property intelligence core.
//!
//! [`IngestPipeline`] runs the per-image unit of work: the Aggregator's
//! incremental update and the Temporal Change Detector's comparison, committed
//! together under a per-listing lock. [`DriftMonitor`] is the independent batch
//! job that scores model outputs against stored baselines and hands drifted
//! windows to an [`AlertSink`].
//!
//! Everything here is generic over [`estate_core::store::IntelligenceStore`].

mod locks;
mod retry;

pub mod aggregator;
pub mod config;
pub mod detector;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod sink;

pub use aggregator::Aggregator;
pub use config::EngineConfig;
pub use detector::ChangeDetector;
pub use error::{Error, Result};
pub use monitor::{BatchReport, DriftJob, DriftMonitor};
pub use pipeline::{IngestOutcome, IngestPipeline};
pub use sink::{AlertSink, DriftAlert, LogAlertSink, NotificationError, WebhookAlertSink};
