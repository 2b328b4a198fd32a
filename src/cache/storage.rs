//! Cache storage trait with SQLite and in-memory implementations.
//!
//! Backends are synchronous; [`PersistentStore`](super::PersistentStore)
//! moves every call onto the blocking pool. Each method is atomic on its
//! own: expiry checks and the matching deletes happen under one lock.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{Lookup, Schema, StoredRecord};
use crate::error::{StoreError, StoreResult};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Create the declared partitions if they do not exist yet.
  fn ensure_partitions(&self, schema: &Schema) -> StoreResult<()>;

  /// Every partition known to the backend, sorted by name.
  fn partitions(&self) -> StoreResult<Vec<String>>;

  /// Insert or wholesale replace one entry.
  fn put(&self, partition: &str, key: &str, record: &StoredRecord) -> StoreResult<()>;

  /// Point lookup. An entry expired at `now` is deleted and reported as `Evicted`.
  fn lookup(&self, partition: &str, key: &str, now: DateTime<Utc>) -> StoreResult<Lookup>;

  fn remove(&self, partition: &str, key: &str) -> StoreResult<()>;

  fn clear(&self, partition: &str) -> StoreResult<()>;

  /// All live entries ordered by key. Expired entries found on the way are deleted.
  fn scan(&self, partition: &str, now: DateTime<Utc>) -> StoreResult<Vec<(String, StoredRecord)>>;

  /// Delete every entry expired at `now`, returning how many were removed.
  fn remove_expired(&self, partition: &str, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Shares one backend between several stores.
impl<S: CacheStorage + ?Sized> CacheStorage for std::sync::Arc<S> {
  fn ensure_partitions(&self, schema: &Schema) -> StoreResult<()> {
    (**self).ensure_partitions(schema)
  }

  fn partitions(&self) -> StoreResult<Vec<String>> {
    (**self).partitions()
  }

  fn put(&self, partition: &str, key: &str, record: &StoredRecord) -> StoreResult<()> {
    (**self).put(partition, key, record)
  }

  fn lookup(&self, partition: &str, key: &str, now: DateTime<Utc>) -> StoreResult<Lookup> {
    (**self).lookup(partition, key, now)
  }

  fn remove(&self, partition: &str, key: &str) -> StoreResult<()> {
    (**self).remove(partition, key)
  }

  fn clear(&self, partition: &str) -> StoreResult<()> {
    (**self).clear(partition)
  }

  fn scan(&self, partition: &str, now: DateTime<Utc>) -> StoreResult<Vec<(String, StoredRecord)>> {
    (**self).scan(partition, now)
  }

  fn remove_expired(&self, partition: &str, now: DateTime<Utc>) -> StoreResult<usize> {
    (**self).remove_expired(partition, now)
  }
}

/// In-process storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: Mutex<HashMap<String, BTreeMap<String, StoredRecord>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_partition<R>(
    &self,
    partition: &str,
    f: impl FnOnce(&mut BTreeMap<String, StoredRecord>) -> R,
  ) -> StoreResult<R> {
    let mut partitions = self
      .partitions
      .lock()
      .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
    let entries = partitions
      .get_mut(partition)
      .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;
    Ok(f(entries))
  }
}

impl CacheStorage for MemoryStorage {
  fn ensure_partitions(&self, schema: &Schema) -> StoreResult<()> {
    let mut partitions = self
      .partitions
      .lock()
      .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
    for name in &schema.partitions {
      partitions.entry(name.clone()).or_default();
    }
    Ok(())
  }

  fn partitions(&self) -> StoreResult<Vec<String>> {
    let partitions = self
      .partitions
      .lock()
      .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
    let mut names: Vec<String> = partitions.keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  fn put(&self, partition: &str, key: &str, record: &StoredRecord) -> StoreResult<()> {
    self.with_partition(partition, |entries| {
      entries.insert(key.to_string(), record.clone());
    })
  }

  fn lookup(&self, partition: &str, key: &str, now: DateTime<Utc>) -> StoreResult<Lookup> {
    self.with_partition(partition, |entries| match entries.get(key) {
      Some(record) if record.is_expired(now) => {
        entries.remove(key);
        Lookup::Evicted
      }
      Some(record) => Lookup::Live(record.clone()),
      None => Lookup::Missing,
    })
  }

  fn remove(&self, partition: &str, key: &str) -> StoreResult<()> {
    self.with_partition(partition, |entries| {
      entries.remove(key);
    })
  }

  fn clear(&self, partition: &str) -> StoreResult<()> {
    self.with_partition(partition, |entries| entries.clear())
  }

  fn scan(&self, partition: &str, now: DateTime<Utc>) -> StoreResult<Vec<(String, StoredRecord)>> {
    self.with_partition(partition, |entries| {
      entries.retain(|_, record| !record.is_expired(now));
      entries
        .iter()
        .map(|(key, record)| (key.clone(), record.clone()))
        .collect()
    })
  }

  fn remove_expired(&self, partition: &str, now: DateTime<Utc>) -> StoreResult<usize> {
    self.with_partition(partition, |entries| {
      let before = entries.len();
      entries.retain(|_, record| !record.is_expired(now));
      before - entries.len()
    })
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> StoreResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Unavailable(format!(
          "failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Unavailable(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Open the cache database at the default location.
  pub fn open_default() -> StoreResult<Self> {
    Self::open(&Self::default_path()?)
  }

  /// A private database that lives as long as this value.
  pub fn in_memory() -> StoreResult<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StoreError::Unavailable(format!("failed to open in-memory database: {}", e)))?;
    Self::from_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> StoreResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Unavailable("could not determine data directory".to_string()))?;

    Ok(data_dir.join("openings-cache").join("cache.db"))
  }

  fn from_connection(conn: Connection) -> StoreResult<Self> {
    conn.busy_timeout(Duration::from_secs(5))?;

    // A read-only or full disk shows up here, before any partition exists.
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| StoreError::Unavailable(format!("failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::LockPoisoned(e.to_string()))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Declared partitions
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    schema_name TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per cached value (serialized JSON)
CREATE TABLE IF NOT EXISTS entries (
    partition_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    data BLOB NOT NULL,
    stored_at_ms INTEGER NOT NULL,
    ttl_ms INTEGER,
    PRIMARY KEY (partition_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_stored_at
    ON entries(partition_name, stored_at_ms);
"#;

/// SQL predicate shared by every expiry delete; `?1` is the partition, `?2` now in ms.
const EXPIRED: &str =
  "partition_name = ?1 AND ttl_ms IS NOT NULL AND stored_at_ms + ttl_ms <= ?2";

fn ttl_to_ms(ttl: Option<Duration>) -> Option<i64> {
  ttl.map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn record_from_row(data: Vec<u8>, stored_at_ms: i64, ttl_ms: Option<i64>) -> StoreResult<StoredRecord> {
  let stored_at = DateTime::from_timestamp_millis(stored_at_ms)
    .ok_or_else(|| StoreError::Corrupt(format!("invalid stored_at_ms {}", stored_at_ms)))?;

  Ok(StoredRecord {
    data,
    stored_at,
    ttl: ttl_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
  })
}

impl CacheStorage for SqliteStorage {
  fn ensure_partitions(&self, schema: &Schema) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for name in &schema.partitions {
      tx.execute(
        "INSERT OR IGNORE INTO partitions (name, schema_name) VALUES (?, ?)",
        params![name, schema.name],
      )?;
    }
    tx.commit()?;
    Ok(())
  }

  fn partitions(&self) -> StoreResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM partitions ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn put(&self, partition: &str, key: &str, record: &StoredRecord) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO entries (partition_name, entry_key, data, stored_at_ms, ttl_ms)
       VALUES (?, ?, ?, ?, ?)",
      params![
        partition,
        key,
        record.data,
        record.stored_at.timestamp_millis(),
        ttl_to_ms(record.ttl)
      ],
    )?;
    Ok(())
  }

  fn lookup(&self, partition: &str, key: &str, now: DateTime<Utc>) -> StoreResult<Lookup> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, i64, Option<i64>)> = conn
      .query_row(
        "SELECT data, stored_at_ms, ttl_ms FROM entries
         WHERE partition_name = ? AND entry_key = ?",
        params![partition, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    let Some((data, stored_at_ms, ttl_ms)) = row else {
      return Ok(Lookup::Missing);
    };

    let record = record_from_row(data, stored_at_ms, ttl_ms)?;
    if record.is_expired(now) {
      conn.execute(
        "DELETE FROM entries WHERE partition_name = ? AND entry_key = ?",
        params![partition, key],
      )?;
      return Ok(Lookup::Evicted);
    }

    Ok(Lookup::Live(record))
  }

  fn remove(&self, partition: &str, key: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM entries WHERE partition_name = ? AND entry_key = ?",
      params![partition, key],
    )?;
    Ok(())
  }

  fn clear(&self, partition: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM entries WHERE partition_name = ?",
      params![partition],
    )?;
    Ok(())
  }

  fn scan(&self, partition: &str, now: DateTime<Utc>) -> StoreResult<Vec<(String, StoredRecord)>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute(
      &format!("DELETE FROM entries WHERE {}", EXPIRED),
      params![partition, now.timestamp_millis()],
    )?;

    let rows = {
      let mut stmt = tx.prepare(
        "SELECT entry_key, data, stored_at_ms, ttl_ms FROM entries
         WHERE partition_name = ?
         ORDER BY entry_key",
      )?;
      let rows = stmt
        .query_map(params![partition], |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<i64>>(3)?,
          ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
      rows
    };

    tx.commit()?;

    rows
      .into_iter()
      .map(|(key, data, stored_at_ms, ttl_ms)| {
        record_from_row(data, stored_at_ms, ttl_ms).map(|record| (key, record))
      })
      .collect()
  }

  fn remove_expired(&self, partition: &str, now: DateTime<Utc>) -> StoreResult<usize> {
    let conn = self.lock()?;
    let removed = conn.execute(
      &format!("DELETE FROM entries WHERE {}", EXPIRED),
      params![partition, now.timestamp_millis()],
    )?;
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
  }

  fn record(data: &str, ttl_secs: Option<u64>) -> StoredRecord {
    StoredRecord {
      data: data.as_bytes().to_vec(),
      stored_at: t0(),
      ttl: ttl_secs.map(Duration::from_secs),
    }
  }

  fn backends() -> Vec<(&'static str, Box<dyn CacheStorage>)> {
    let schema = Schema::new("test", ["plans", "regions"]);
    let memory = MemoryStorage::new();
    memory.ensure_partitions(&schema).unwrap();
    let sqlite = SqliteStorage::in_memory().unwrap();
    sqlite.ensure_partitions(&schema).unwrap();
    vec![("memory", Box::new(memory)), ("sqlite", Box::new(sqlite))]
  }

  #[test]
  fn test_lookup_evicts_expired_entry() {
    for (name, storage) in backends() {
      storage.put("plans", "plan_list", &record("[1]", Some(60))).unwrap();

      let live = storage
        .lookup("plans", "plan_list", t0() + chrono::Duration::seconds(59))
        .unwrap();
      assert_eq!(live, Lookup::Live(record("[1]", Some(60))), "{}", name);

      let gone = storage
        .lookup("plans", "plan_list", t0() + chrono::Duration::seconds(60))
        .unwrap();
      assert_eq!(gone, Lookup::Evicted, "{}", name);

      let again = storage.lookup("plans", "plan_list", t0()).unwrap();
      assert_eq!(again, Lookup::Missing, "{}", name);
    }
  }

  #[test]
  fn test_partitions_do_not_collide() {
    for (name, storage) in backends() {
      storage.put("plans", "same", &record("\"plan\"", None)).unwrap();
      storage.put("regions", "same", &record("\"region\"", None)).unwrap();

      storage.clear("plans").unwrap();

      assert_eq!(storage.lookup("plans", "same", t0()).unwrap(), Lookup::Missing, "{}", name);
      assert_eq!(
        storage.lookup("regions", "same", t0()).unwrap(),
        Lookup::Live(record("\"region\"", None)),
        "{}",
        name
      );
    }
  }

  #[test]
  fn test_scan_skips_and_removes_expired() {
    for (name, storage) in backends() {
      storage.put("plans", "b", &record("2", Some(10))).unwrap();
      storage.put("plans", "a", &record("1", None)).unwrap();
      storage.put("plans", "c", &record("3", Some(1000))).unwrap();

      let later = t0() + chrono::Duration::seconds(10);
      let keys: Vec<String> = storage
        .scan("plans", later)
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
      assert_eq!(keys, vec!["a", "c"], "{}", name);

      // The expired row is gone, not merely hidden.
      assert_eq!(storage.remove_expired("plans", later).unwrap(), 0, "{}", name);
    }
  }

  #[test]
  fn test_remove_expired_counts() {
    for (name, storage) in backends() {
      storage.put("regions", "north", &record("1", Some(5))).unwrap();
      storage.put("regions", "south", &record("2", Some(5))).unwrap();
      storage.put("regions", "east", &record("3", None)).unwrap();

      let removed = storage
        .remove_expired("regions", t0() + chrono::Duration::seconds(30))
        .unwrap();
      assert_eq!(removed, 2, "{}", name);
    }
  }

  #[test]
  fn test_put_replaces_wholesale() {
    for (name, storage) in backends() {
      storage.put("plans", "p1", &record("{\"a\":1}", Some(5))).unwrap();
      storage.put("plans", "p1", &record("{\"b\":2}", None)).unwrap();

      assert_eq!(
        storage.lookup("plans", "p1", t0() + chrono::Duration::hours(1)).unwrap(),
        Lookup::Live(record("{\"b\":2}", None)),
        "{}",
        name
      );
    }
  }

  #[test]
  fn test_memory_unknown_partition() {
    let storage = MemoryStorage::new();
    let err = storage.put("plans", "k", &record("1", None)).unwrap_err();
    assert!(matches!(err, StoreError::UnknownPartition(p) if p == "plans"));
  }

  #[test]
  fn test_ensure_partitions_is_idempotent() {
    let storage = SqliteStorage::in_memory().unwrap();
    let schema = Schema::new("test", ["plans", "regions"]);
    storage.ensure_partitions(&schema).unwrap();
    storage.ensure_partitions(&schema).unwrap();

    assert_eq!(storage.partitions().unwrap(), vec!["plans", "regions"]);
  }

  #[cfg(unix)]
  #[test]
  fn test_open_reports_unavailable() {
    let result = SqliteStorage::open(Path::new("/dev/null/openings-cache/cache.db"));
    assert!(matches!(result, Err(StoreError::Unavailable(_))));
  }
}
