//! Bounded retry with exponential backoff for store operations.

use std::{future::Future, time::Duration};

use estate_core::store::StoreError;
use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Doubling delay, capped at the configured maximum.
pub(crate) struct Backoff {
  next: Duration,
  max:  Duration,
}

impl Backoff {
  pub(crate) fn new(config: &RetryConfig) -> Self {
    Self { next: config.initial_backoff(), max: config.max_backoff() }
  }

  pub(crate) async fn wait(&mut self) {
    tokio::time::sleep(self.next).await;
    self.next = (self.next * 2).min(self.max);
  }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Conflicts are retried at once, since `op` re-reads its state on every
/// call. Transient failures wait out the backoff first. The last error is
/// returned unchanged.
pub(crate) async fn with_retry<T, E, F, Fut>(
  config: &RetryConfig,
  what: &'static str,
  mut op: F,
) -> Result<T, E>
where
  E: StoreError,
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  let mut backoff = Backoff::new(config);
  let mut attempt = 1;
  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if attempt < config.max_attempts && e.is_conflict() => {
        warn!(what, attempt, error = %e, "conflict; retrying with a fresh read");
      }
      Err(e) if attempt < config.max_attempts && e.is_transient() => {
        warn!(what, attempt, error = %e, "store unavailable; backing off");
        backoff.wait().await;
      }
      Err(e) => {
        debug!(what, attempt, error = %e, "giving up");
        return Err(e);
      }
    }
    attempt += 1;
  }
}
