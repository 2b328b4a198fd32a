//! Persistent, partitioned cache used for offline support.
//!
//! This module provides:
//! - A durable key-value store split into named partitions
//! - Per-entry TTLs with lazy eviction on read
//! - SQLite and in-memory backends behind one storage trait
//! - An optional background sweeper that bounds storage growth

mod clock;
mod storage;
mod store;
mod sweeper;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use store::PersistentStore;
pub use sweeper::SweepWorker;
pub use traits::{CacheEntry, Cacheable, Lookup, Provenance, Schema, StoredRecord};
