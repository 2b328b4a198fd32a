//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Values that can be stored in the cache and published by a resource.
///
/// The cache never inspects the shape of a value; it only needs to serialize
/// it. Implemented for every type with the right bounds.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A decoded cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: String,
  pub value: T,
  pub stored_at: DateTime<Utc>,
  /// `None` means the entry never expires on its own.
  pub ttl: Option<Duration>,
}

impl<T> CacheEntry<T> {
  /// Instant at which the entry stops being valid, if it has a TTL.
  pub fn expires_at(&self) -> Option<DateTime<Utc>> {
    expiry(self.stored_at, self.ttl)
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at().is_some_and(|at| now >= at)
  }
}

/// Raw record as held by a storage backend (value still serialized).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
  pub data: Vec<u8>,
  pub stored_at: DateTime<Utc>,
  pub ttl: Option<Duration>,
}

impl StoredRecord {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    expiry(self.stored_at, self.ttl).is_some_and(|at| now >= at)
  }
}

/// A TTL too large to represent never expires.
fn expiry(stored_at: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
  let ttl = chrono::Duration::from_std(ttl?).ok()?;
  stored_at.checked_add_signed(ttl)
}

/// Outcome of a point lookup in a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
  Live(StoredRecord),
  /// The entry existed but had expired; the backend removed it.
  Evicted,
  Missing,
}

/// Declared layout of a store: its name and the partitions it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
  pub name: String,
  pub partitions: Vec<String>,
}

impl Schema {
  pub fn new<I, S>(name: impl Into<String>, partitions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      name: name.into(),
      partitions: partitions.into_iter().map(Into::into).collect(),
    }
  }
}

/// Where a published value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
  /// Read from the persistent store; possibly stale
  Cache,
  /// Fresh from a remote fetch
  Network,
}
