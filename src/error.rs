//! Error types for the cache, connectivity and resource layers.

use thiserror::Error;

/// Failures raised by the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
  /// The platform refused storage access entirely (directory not creatable,
  /// database not openable, disk full).
  #[error("Storage unavailable: {0}")]
  Unavailable(String),

  #[error("Partition '{0}' was not declared in the store schema")]
  UnknownPartition(String),

  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Corrupt cache record: {0}")]
  Corrupt(String),

  #[error("Storage task failed: {0}")]
  Task(String),

  #[error("Lock poisoned: {0}")]
  LockPoisoned(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced to consumers of a synced resource.
///
/// Cloneable so the same error can be published to every subscriber and
/// handed to every caller attached to a coalesced refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
  /// Offline with nothing cached; no fetch was attempted.
  #[error("Network unavailable and no cached data")]
  NetworkUnavailable,

  /// A fetch was attempted and rejected, and the cache had nothing to fall back on.
  #[error("Fetch failed: {0}")]
  FetchFailed(String),

  /// Cache I/O failed. Only reported for explicit cache operations such as
  /// `clear_cache`; reads downgrade it to a miss.
  #[error("Storage error: {0}")]
  Storage(String),
}

impl From<StoreError> for ResourceError {
  fn from(err: StoreError) -> Self {
    ResourceError::Storage(err.to_string())
  }
}
