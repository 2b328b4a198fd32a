//! Asynchronous, partitioned persistent store.

use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::storage::CacheStorage;
use super::traits::{CacheEntry, Cacheable, Lookup, Schema, StoredRecord};
use crate::error::{StoreError, StoreResult};

/// Handle to a partitioned key-value store that survives restarts.
///
/// Cloning is cheap; clones share the backend. Pass a handle to every
/// component that needs the cache instead of reaching for a global.
///
/// Reads never return expired data: a point read that finds an expired entry
/// deletes it and reports a miss, and bulk reads filter before returning.
#[derive(Clone)]
pub struct PersistentStore {
  backend: Arc<dyn CacheStorage>,
  clock: Arc<dyn Clock>,
  partitions: Arc<BTreeSet<String>>,
}

impl PersistentStore {
  /// Open the store over `backend`, creating the schema's partitions if needed.
  ///
  /// Safe to call repeatedly with the same schema.
  pub async fn open<S>(backend: S, schema: Schema) -> StoreResult<Self>
  where
    S: CacheStorage + 'static,
  {
    Self::open_with_clock(backend, schema, Arc::new(SystemClock)).await
  }

  /// Like [`open`](Self::open) but with an explicit time source.
  pub async fn open_with_clock<S>(
    backend: S,
    schema: Schema,
    clock: Arc<dyn Clock>,
  ) -> StoreResult<Self>
  where
    S: CacheStorage + 'static,
  {
    let backend: Arc<dyn CacheStorage> = Arc::new(backend);

    let known = blocking(&backend, move |b| {
      b.ensure_partitions(&schema)?;
      b.partitions()
    })
    .await
    .map_err(|e| match e {
      StoreError::Sqlite(err) => StoreError::Unavailable(err.to_string()),
      other => other,
    })?;

    debug!(partitions = ?known, "Opened persistent store");

    Ok(Self {
      backend,
      clock,
      partitions: Arc::new(known.into_iter().collect()),
    })
  }

  /// Names of every partition this store accepts.
  pub fn partitions(&self) -> impl Iterator<Item = &str> {
    self.partitions.iter().map(String::as_str)
  }

  /// Overwrite the entry at `(partition, key)`, stamping it with the current time.
  pub async fn set<T: Cacheable>(
    &self,
    partition: &str,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
  ) -> StoreResult<()> {
    self.check_partition(partition)?;

    let record = StoredRecord {
      data: serde_json::to_vec(value)?,
      stored_at: self.clock.now(),
      ttl,
    };
    let (partition, key) = (partition.to_string(), key.to_string());

    blocking(&self.backend, move |b| b.put(&partition, &key, &record)).await
  }

  /// Read a value. Expired entries are deleted and reported as absent.
  pub async fn get<T: DeserializeOwned + Send + 'static>(
    &self,
    partition: &str,
    key: &str,
  ) -> StoreResult<Option<T>> {
    Ok(self.entry(partition, key).await?.map(|entry| entry.value))
  }

  /// Read a value together with its metadata.
  pub async fn entry<T: DeserializeOwned + Send + 'static>(
    &self,
    partition: &str,
    key: &str,
  ) -> StoreResult<Option<CacheEntry<T>>> {
    self.check_partition(partition)?;

    let now = self.clock.now();
    let (p, k) = (partition.to_string(), key.to_string());
    let lookup = blocking(&self.backend, move |b| b.lookup(&p, &k, now)).await?;

    match lookup {
      Lookup::Live(record) => Ok(Some(decode(key.to_string(), record)?)),
      Lookup::Evicted => {
        debug!(partition, key, "Evicted expired cache entry on read");
        Ok(None)
      }
      Lookup::Missing => Ok(None),
    }
  }

  pub async fn delete(&self, partition: &str, key: &str) -> StoreResult<()> {
    self.check_partition(partition)?;
    let (partition, key) = (partition.to_string(), key.to_string());
    blocking(&self.backend, move |b| b.remove(&partition, &key)).await
  }

  /// Remove every entry in one partition. Other partitions are untouched.
  pub async fn clear(&self, partition: &str) -> StoreResult<()> {
    self.check_partition(partition)?;
    let partition = partition.to_string();
    blocking(&self.backend, move |b| b.clear(&partition)).await
  }

  /// All non-expired values in a partition, ordered by key.
  pub async fn get_all<T: DeserializeOwned + Send + 'static>(
    &self,
    partition: &str,
  ) -> StoreResult<Vec<T>> {
    Ok(
      self
        .entries(partition)
        .await?
        .into_iter()
        .map(|entry| entry.value)
        .collect(),
    )
  }

  /// All non-expired entries in a partition with their metadata, ordered by key.
  pub async fn entries<T: DeserializeOwned + Send + 'static>(
    &self,
    partition: &str,
  ) -> StoreResult<Vec<CacheEntry<T>>> {
    self.check_partition(partition)?;

    let now = self.clock.now();
    let p = partition.to_string();
    let rows = blocking(&self.backend, move |b| b.scan(&p, now)).await?;

    rows
      .into_iter()
      .map(|(key, record)| decode(key, record))
      .collect()
  }

  /// Delete expired entries in a partition. Returns how many were removed.
  pub async fn sweep(&self, partition: &str) -> StoreResult<usize> {
    self.check_partition(partition)?;

    let now = self.clock.now();
    let p = partition.to_string();
    let removed = blocking(&self.backend, move |b| b.remove_expired(&p, now)).await?;

    if removed > 0 {
      debug!(partition, removed, "Swept expired cache entries");
    }
    Ok(removed)
  }

  fn check_partition(&self, partition: &str) -> StoreResult<()> {
    if self.partitions.contains(partition) {
      Ok(())
    } else {
      Err(StoreError::UnknownPartition(partition.to_string()))
    }
  }
}

impl std::fmt::Debug for PersistentStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PersistentStore")
      .field("partitions", &self.partitions)
      .finish_non_exhaustive()
  }
}

fn decode<T: DeserializeOwned>(key: String, record: StoredRecord) -> StoreResult<CacheEntry<T>> {
  Ok(CacheEntry {
    key,
    value: serde_json::from_slice(&record.data)?,
    stored_at: record.stored_at,
    ttl: record.ttl,
  })
}

/// Run a backend call on the blocking pool.
async fn blocking<R, F>(backend: &Arc<dyn CacheStorage>, f: F) -> StoreResult<R>
where
  R: Send + 'static,
  F: FnOnce(&dyn CacheStorage) -> StoreResult<R> + Send + 'static,
{
  let backend = Arc::clone(backend);
  tokio::task::spawn_blocking(move || f(backend.as_ref()))
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::storage::{MemoryStorage, SqliteStorage};
  use chrono::{TimeZone, Utc};
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Plan {
    id: u32,
    name: String,
  }

  fn plan(id: u32) -> Plan {
    Plan {
      id,
      name: format!("plan-{}", id),
    }
  }

  async fn store_with_clock() -> (PersistentStore, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
    let store = PersistentStore::open_with_clock(
      SqliteStorage::in_memory().unwrap(),
      Schema::new("openings", ["plans", "regions"]),
      Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    (store, clock)
  }

  #[tokio::test]
  async fn test_ttl_scenario_plan_list() {
    let (store, clock) = store_with_clock().await;
    let ttl = Some(Duration::from_secs(5 * 60));

    store.set("plans", "plan_list", &vec![plan(1)], ttl).await.unwrap();

    clock.advance(Duration::from_secs(4 * 60));
    let read: Option<Vec<Plan>> = store.get("plans", "plan_list").await.unwrap();
    assert_eq!(read, Some(vec![plan(1)]));

    clock.advance(Duration::from_secs(2 * 60));
    let read: Option<Vec<Plan>> = store.get("plans", "plan_list").await.unwrap();
    assert_eq!(read, None);

    // Removed from storage, not just hidden: winding the clock back finds nothing.
    clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
    let read: Option<Vec<Plan>> = store.get("plans", "plan_list").await.unwrap();
    assert_eq!(read, None);
  }

  #[tokio::test]
  async fn test_ttl_exact_boundary_is_expired() {
    let (store, clock) = store_with_clock().await;
    store
      .set("plans", "p", &plan(1), Some(Duration::from_secs(60)))
      .await
      .unwrap();

    clock.advance(Duration::from_secs(60));
    assert_eq!(store.get::<Plan>("plans", "p").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_consecutive_reads_are_identical() {
    let (store, clock) = store_with_clock().await;
    store
      .set("plans", "p", &plan(7), Some(Duration::from_secs(60)))
      .await
      .unwrap();
    clock.advance(Duration::from_secs(10));

    let first: Option<Plan> = store.get("plans", "p").await.unwrap();
    let second: Option<Plan> = store.get("plans", "p").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, Some(plan(7)));
  }

  #[tokio::test]
  async fn test_get_all_does_not_resurrect_expired() {
    let (store, clock) = store_with_clock().await;
    store
      .set("plans", "a", &plan(1), Some(Duration::from_secs(30)))
      .await
      .unwrap();
    store.set("plans", "b", &plan(2), None).await.unwrap();

    clock.advance(Duration::from_secs(31));

    let all: Vec<Plan> = store.get_all("plans").await.unwrap();
    assert_eq!(all, vec![plan(2)]);
    assert_eq!(store.get::<Plan>("plans", "a").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_entries_carry_metadata() {
    let (store, clock) = store_with_clock().await;
    let stored_at = clock.now();
    store
      .set("regions", "north", &"Nord".to_string(), Some(Duration::from_secs(90)))
      .await
      .unwrap();

    let entries: Vec<CacheEntry<String>> = store.entries("regions").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "north");
    assert_eq!(entries[0].value, "Nord");
    assert_eq!(entries[0].stored_at, stored_at);
    assert_eq!(entries[0].ttl, Some(Duration::from_secs(90)));
  }

  #[tokio::test]
  async fn test_delete_and_clear() {
    let (store, _clock) = store_with_clock().await;
    store.set("plans", "a", &plan(1), None).await.unwrap();
    store.set("plans", "b", &plan(2), None).await.unwrap();
    store.set("regions", "a", &"west".to_string(), None).await.unwrap();

    store.delete("plans", "a").await.unwrap();
    assert_eq!(store.get::<Plan>("plans", "a").await.unwrap(), None);
    assert_eq!(store.get::<Plan>("plans", "b").await.unwrap(), Some(plan(2)));

    store.clear("plans").await.unwrap();
    assert!(store.get_all::<Plan>("plans").await.unwrap().is_empty());
    assert_eq!(
      store.get::<String>("regions", "a").await.unwrap(),
      Some("west".to_string())
    );
  }

  #[tokio::test]
  async fn test_sweep_removes_only_expired() {
    let (store, clock) = store_with_clock().await;
    store
      .set("plans", "short", &plan(1), Some(Duration::from_secs(5)))
      .await
      .unwrap();
    store
      .set("plans", "long", &plan(2), Some(Duration::from_secs(500)))
      .await
      .unwrap();

    clock.advance(Duration::from_secs(10));
    assert_eq!(store.sweep("plans").await.unwrap(), 1);
    assert_eq!(store.sweep("plans").await.unwrap(), 0);
    assert_eq!(store.get::<Plan>("plans", "long").await.unwrap(), Some(plan(2)));
  }

  #[tokio::test]
  async fn test_unknown_partition_is_rejected() {
    let (store, _clock) = store_with_clock().await;
    let err = store.set("approvals", "x", &1, None).await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownPartition(p) if p == "approvals"));
  }

  #[tokio::test]
  async fn test_open_is_idempotent_and_keeps_data() {
    let backend = Arc::new(MemoryStorage::new());
    let schema = Schema::new("openings", ["plans"]);

    let first = PersistentStore::open(backend.clone(), schema.clone())
      .await
      .unwrap();
    first.set("plans", "a", &plan(1), None).await.unwrap();

    let second = PersistentStore::open(backend, schema).await.unwrap();
    assert_eq!(second.get::<Plan>("plans", "a").await.unwrap(), Some(plan(1)));
    assert_eq!(second.partitions().collect::<Vec<_>>(), vec!["plans"]);
  }

  #[tokio::test]
  async fn test_sqlite_data_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cache.db");
    let schema = Schema::new("openings", ["plans", "regions"]);
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
    let stored_at = clock.now();

    {
      let store = PersistentStore::open_with_clock(
        SqliteStorage::open(&path).unwrap(),
        schema.clone(),
        Arc::new(clock.clone()),
      )
      .await
      .unwrap();
      store
        .set("plans", "plan_list", &vec![plan(1), plan(2)], Some(Duration::from_secs(600)))
        .await
        .unwrap();
    }

    clock.advance(Duration::from_secs(60));
    let reopened = PersistentStore::open_with_clock(
      SqliteStorage::open(&path).unwrap(),
      schema,
      Arc::new(clock.clone()),
    )
    .await
    .unwrap();

    let entry = reopened
      .entry::<Vec<Plan>>("plans", "plan_list")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(entry.value, vec![plan(1), plan(2)]);
    assert_eq!(entry.stored_at, stored_at);
    assert_eq!(entry.ttl, Some(Duration::from_secs(600)));
    assert_eq!(reopened.partitions().collect::<Vec<_>>(), vec!["plans", "regions"]);

    // Expiry still applies across the restart.
    clock.advance(Duration::from_secs(600));
    assert_eq!(reopened.get::<Vec<Plan>>("plans", "plan_list").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_type_mismatch_is_a_serialization_error() {
    let (store, _clock) = store_with_clock().await;
    store.set("plans", "a", &"not a plan".to_string(), None).await.unwrap();

    let err = store.get::<Plan>("plans", "a").await.unwrap_err();
    assert!(matches!(err, StoreError::Serialization(_)));
  }
}
