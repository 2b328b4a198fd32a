//! Background task that bounds cache growth by evicting expired entries.

use std::time::Duration;
use tokio::task::JoinHandle;

use super::store::PersistentStore;

/// Periodically sweeps every partition of a store.
///
/// Reads already evict lazily, so this only matters for entries nobody
/// reads again.
pub struct SweepWorker {
  store: PersistentStore,
  interval: Duration,
}

impl SweepWorker {
  pub fn new(store: PersistentStore, interval: Duration) -> Self {
    Self { store, interval }
  }

  /// One pass over all partitions. Returns the number of entries removed.
  pub async fn sweep_all(&self) -> usize {
    let mut total_deleted = 0;

    for partition in self.store.partitions() {
      match self.store.sweep(partition).await {
        Ok(count) => total_deleted += count,
        Err(e) => tracing::warn!(partition, error = %e, "Cache sweep failed"),
      }
    }

    if total_deleted > 0 {
      tracing::info!("Sweep removed {} expired cache entries", total_deleted);
    }
    total_deleted
  }

  /// Run the sweep loop on the runtime. Abort the handle to stop it.
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      tracing::info!("Starting cache sweeper (interval: {:?})", self.interval);
      let mut ticker = tokio::time::interval(self.interval);
      // The first tick completes immediately.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        self.sweep_all().await;
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::traits::Schema;
  use std::sync::Arc;

  #[tokio::test]
  async fn test_sweep_all_covers_every_partition() {
    let clock = ManualClock::default();
    let store = PersistentStore::open_with_clock(
      MemoryStorage::new(),
      Schema::new("openings", ["plans", "regions", "messages"]),
      Arc::new(clock.clone()),
    )
    .await
    .unwrap();

    let short = Some(Duration::from_secs(1));
    store.set("plans", "a", &1, short).await.unwrap();
    store.set("regions", "b", &2, short).await.unwrap();
    store.set("messages", "c", &3, None).await.unwrap();

    clock.advance(Duration::from_secs(5));

    let worker = SweepWorker::new(store.clone(), Duration::from_secs(60));
    assert_eq!(worker.sweep_all().await, 2);
    assert_eq!(store.get::<i32>("messages", "c").await.unwrap(), Some(3));
  }
}
