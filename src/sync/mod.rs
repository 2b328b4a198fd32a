//! Stale-while-revalidate resources layered over the cache and the network monitor.

mod resource;
mod types;

pub use resource::SyncedResource;
pub use types::{
  RefreshOutcome, RemoteFetch, ResourceDescriptor, ResourceOptions, ResourceState, ResourceStatus,
};
