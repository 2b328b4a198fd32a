//! Offline data cache and sync layer.
//!
//! Three pieces work together:
//! - [`cache::PersistentStore`]: partitioned key-value storage with per-entry TTLs
//! - [`network::NetworkMonitor`]: Online / Degraded / Offline classification
//! - [`sync::SyncedResource`]: stale-while-revalidate over one cached remote value

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod network;
pub mod sync;

pub use cache::{PersistentStore, Provenance, Schema};
pub use error::{ResourceError, StoreError, StoreResult};
pub use network::{ConnectivityState, NetworkMonitor};
pub use sync::{RefreshOutcome, ResourceDescriptor, ResourceOptions, ResourceState, SyncedResource};
