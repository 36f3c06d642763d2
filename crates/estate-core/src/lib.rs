//! Core types, pure algorithms and the store trait for the property
//! intelligence engine.
//!
//! No database, network or runtime dependencies. The streaming fold, the
//! change comparison and the drift statistic are plain functions that the
//! engine composes inside one unit of work.

pub mod aggregation;
pub mod change;
pub mod drift;
pub mod error;
pub mod listing;
pub mod prediction;
pub mod store;

pub use error::{Error, Result};
