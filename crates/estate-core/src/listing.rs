//! Listing: the property a set of images belongs to.
//!
//! Listing CRUD is owned elsewhere; this core only needs to know that a
//! listing exists before it aggregates predictions for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
  pub listing_id: Uuid,
  pub created_at: DateTime<Utc>,
}
