//! Descriptor, published state and outcomes of a synced resource.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Provenance;
use crate::error::ResourceError;

/// A factory for remote fetches. Errors are carried as their display text.
pub type RemoteFetch<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, String>> + Send + Sync>;

/// Immutable definition of one synced resource: where it is cached, for how
/// long, and how to fetch it.
pub struct ResourceDescriptor<T> {
  pub partition: String,
  pub key: String,
  pub ttl: Option<Duration>,
  fetch: RemoteFetch<T>,
}

impl<T: Send + 'static> ResourceDescriptor<T> {
  /// Create a descriptor from any async fetcher.
  ///
  /// The fetcher is called for every network attempt. Its error type only
  /// needs to be displayable; the text ends up in
  /// [`ResourceError::FetchFailed`].
  pub fn new<F, Fut, E>(
    partition: impl Into<String>,
    key: impl Into<String>,
    ttl: Option<Duration>,
    fetch: F,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: fmt::Display,
  {
    Self {
      partition: partition.into(),
      key: key.into(),
      ttl,
      fetch: Arc::new(move || {
        let fut = fetch();
        Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
      }),
    }
  }

  pub(crate) fn fetch(&self) -> BoxFuture<'static, Result<T, String>> {
    (self.fetch)()
  }
}

impl<T> Clone for ResourceDescriptor<T> {
  fn clone(&self) -> Self {
    Self {
      partition: self.partition.clone(),
      key: self.key.clone(),
      ttl: self.ttl,
      fetch: Arc::clone(&self.fetch),
    }
  }
}

impl<T> fmt::Debug for ResourceDescriptor<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResourceDescriptor")
      .field("partition", &self.partition)
      .field("key", &self.key)
      .field("ttl", &self.ttl)
      .finish_non_exhaustive()
  }
}

/// Behaviour switches for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceOptions {
  /// Read the cache and fetch as soon as the resource is created.
  pub auto_fetch: bool,
}

impl Default for ResourceOptions {
  fn default() -> Self {
    Self { auto_fetch: true }
  }
}

/// What subscribers see. Republished on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
  pub value: Option<T>,
  /// `None` until a value has been published
  pub provenance: Option<Provenance>,
  pub loading: bool,
  pub last_error: Option<ResourceError>,
}

impl<T> Default for ResourceState<T> {
  fn default() -> Self {
    Self {
      value: None,
      provenance: None,
      loading: false,
      last_error: None,
    }
  }
}

/// The condition a screen should present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
  /// Nothing to show yet; work is under way
  Loading,
  /// Showing a value fetched from the network
  Fresh,
  /// Showing a cached value that may be outdated
  StaleDataServed,
  /// Nothing to show and nothing pending
  Empty,
}

impl<T> ResourceState<T> {
  pub fn status(&self) -> ResourceStatus {
    match (&self.value, self.provenance) {
      (Some(_), Some(Provenance::Network)) => ResourceStatus::Fresh,
      (Some(_), _) => ResourceStatus::StaleDataServed,
      (None, _) if self.loading => ResourceStatus::Loading,
      (None, _) => ResourceStatus::Empty,
    }
  }
}

/// How a refresh resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
  /// The fetch succeeded and the new value was published
  Fetched,
  /// The fetch failed; a cached value was published instead
  CacheFallback,
  /// The fetch failed and nothing was cached
  Failed,
  /// No fetch was attempted; whatever the cache held was served
  Skipped,
}

impl RefreshOutcome {
  /// Whether fresh data arrived from the network.
  pub fn fetched(self) -> bool {
    matches!(self, RefreshOutcome::Fetched)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_distinguishes_presentations() {
    let mut state: ResourceState<u32> = ResourceState {
      loading: true,
      ..Default::default()
    };
    assert_eq!(state.status(), ResourceStatus::Loading);

    state.loading = false;
    assert_eq!(state.status(), ResourceStatus::Empty);

    state.value = Some(1);
    state.provenance = Some(Provenance::Cache);
    assert_eq!(state.status(), ResourceStatus::StaleDataServed);

    state.provenance = Some(Provenance::Network);
    assert_eq!(state.status(), ResourceStatus::Fresh);
  }

  #[tokio::test]
  async fn test_descriptor_stringifies_errors() {
    let descriptor: ResourceDescriptor<u32> =
      ResourceDescriptor::new("plans", "plan_list", None, || async {
        Err::<u32, _>(std::io::Error::other("connection reset"))
      });

    assert_eq!(descriptor.fetch().await, Err("connection reset".to_string()));
  }
}
