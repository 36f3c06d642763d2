//! Per-listing serialisation of aggregate updates.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Idle entries are pruned once the map grows past this.
const PRUNE_AT: usize = 1024;

/// One async mutex per listing. Different listings never contend.
#[derive(Debug, Default)]
pub(crate) struct ListingLocks {
  inner: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ListingLocks {
  /// Wait for exclusive access to `listing_id`'s aggregate.
  pub(crate) async fn lock(&self, listing_id: Uuid) -> OwnedMutexGuard<()> {
    // The map shard guard must be released before awaiting.
    let mutex = Arc::clone(self.inner.entry(listing_id).or_default().value());
    mutex.lock_owned().await
  }

  /// Drop entries nobody holds or waits on.
  pub(crate) fn prune(&self) {
    if self.inner.len() >= PRUNE_AT {
      self.inner.retain(|_, m| Arc::strong_count(m) > 1);
    }
  }

  #[cfg(test)]
  fn len(&self) -> usize { self.inner.len() }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[tokio::test]
  async fn same_listing_is_exclusive() {
    let locks = Arc::new(ListingLocks::default());
    let id = Uuid::new_v4();

    let guard = locks.lock(id).await;
    let waiter = {
      let locks = Arc::clone(&locks);
      tokio::spawn(async move {
        let _g = locks.lock(id).await;
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(guard);
    waiter.await.unwrap();
  }

  #[tokio::test]
  async fn different_listings_do_not_contend() {
    let locks = ListingLocks::default();
    let _a = locks.lock(Uuid::new_v4()).await;
    let _b = locks.lock(Uuid::new_v4()).await;
    assert_eq!(locks.len(), 2);
  }
}
