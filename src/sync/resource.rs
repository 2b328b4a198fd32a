//! Stale-while-revalidate orchestration for one cached remote value.
//!
//! A [`SyncedResource`] owns the published state for one
//! [`ResourceDescriptor`]. It serves the cache first, revalidates over the
//! network when connectivity allows, writes fresh results back to the
//! store, and refreshes itself when the link comes back.
//!
//! # Example
//!
//! ```ignore
//! let descriptor = ResourceDescriptor::new("plans", "plan_list", Some(ttl), move || {
//!     let api = api.clone();
//!     async move { api.list_plans().await }
//! });
//! let plans = SyncedResource::new(descriptor, store.clone(), monitor.clone(), Default::default());
//!
//! let mut rx = plans.watch();
//! while rx.changed().await.is_ok() {
//!     match rx.borrow().status() {
//!         ResourceStatus::Loading => render_spinner(),
//!         ResourceStatus::Fresh | ResourceStatus::StaleDataServed => render_plans(),
//!         ResourceStatus::Empty => render_empty(),
//!     }
//! }
//! ```

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{RefreshOutcome, ResourceDescriptor, ResourceOptions, ResourceState};
use crate::cache::{Cacheable, PersistentStore, Provenance};
use crate::error::ResourceError;
use crate::network::{ConnectivityState, NetworkMonitor, Subscription};

/// A network attempt that several callers may await at once.
type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Live view of one descriptor. Dropping it tears the resource down: the
/// monitor subscription is released and late results are discarded.
pub struct SyncedResource<T: Cacheable> {
  inner: Arc<ResourceInner<T>>,
  reconnect_task: JoinHandle<()>,
  _subscription: Subscription,
}

struct ResourceInner<T: Cacheable> {
  descriptor: ResourceDescriptor<T>,
  store: PersistentStore,
  monitor: NetworkMonitor,
  state_tx: watch::Sender<ResourceState<T>>,
  /// Cleared on teardown; checked right before every publish.
  alive: AtomicBool,
  inflight: Mutex<Option<InFlight>>,
}

impl<T: Cacheable> SyncedResource<T> {
  /// Create the resource and, unless disabled, start loading it.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(
    descriptor: ResourceDescriptor<T>,
    store: PersistentStore,
    monitor: NetworkMonitor,
    options: ResourceOptions,
  ) -> Self {
    let (state_tx, _) = watch::channel(ResourceState {
      loading: options.auto_fetch,
      ..Default::default()
    });

    let inner = Arc::new(ResourceInner {
      descriptor,
      store,
      monitor,
      state_tx,
      alive: AtomicBool::new(true),
      inflight: Mutex::new(None),
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = inner.monitor.subscribe(move |state| {
      let _ = tx.send(state);
    });
    let reconnect_task = tokio::spawn(follow_connectivity(
      Arc::downgrade(&inner),
      inner.monitor.current_state(),
      rx,
    ));

    if options.auto_fetch {
      tokio::spawn(Arc::clone(&inner).initialize());
    }

    Self {
      inner,
      reconnect_task,
      _subscription: subscription,
    }
  }

  pub fn descriptor(&self) -> &ResourceDescriptor<T> {
    &self.inner.descriptor
  }

  /// Snapshot of the published state.
  pub fn state(&self) -> ResourceState<T> {
    self.inner.state_tx.borrow().clone()
  }

  pub fn value(&self) -> Option<T> {
    self.inner.state_tx.borrow().value.clone()
  }

  pub fn provenance(&self) -> Option<Provenance> {
    self.inner.state_tx.borrow().provenance
  }

  pub fn is_loading(&self) -> bool {
    self.inner.state_tx.borrow().loading
  }

  pub fn last_error(&self) -> Option<ResourceError> {
    self.inner.state_tx.borrow().last_error.clone()
  }

  /// Receiver notified on every published transition.
  pub fn watch(&self) -> watch::Receiver<ResourceState<T>> {
    self.inner.state_tx.subscribe()
  }

  /// Revalidate the value.
  ///
  /// Goes to the network when Online, when `force_network` is set on a
  /// Degraded link, or when a Degraded link is all there is and the cache is
  /// empty. Otherwise serves the cache and reports `Skipped`. Offline never
  /// fetches. A call made while a fetch is in flight joins that fetch and
  /// resolves with its outcome.
  pub async fn refresh(&self, force_network: bool) -> RefreshOutcome {
    Arc::clone(&self.inner).refresh(force_network).await
  }

  /// Delete the cached entry. The published value stays until the next refresh.
  pub async fn clear_cache(&self) -> Result<(), ResourceError> {
    let d = &self.inner.descriptor;
    self.inner.store.delete(&d.partition, &d.key).await?;
    Ok(())
  }
}

impl<T: Cacheable> Drop for SyncedResource<T> {
  fn drop(&mut self) {
    self.inner.alive.store(false, Ordering::SeqCst);
    self.reconnect_task.abort();
  }
}

impl<T: Cacheable + std::fmt::Debug> std::fmt::Debug for SyncedResource<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SyncedResource")
      .field("descriptor", &self.inner.descriptor)
      .field("state", &*self.inner.state_tx.borrow())
      .finish_non_exhaustive()
  }
}

/// Issue one refresh on every transition into Online while showing cached data.
async fn follow_connectivity<T: Cacheable>(
  inner: Weak<ResourceInner<T>>,
  mut previous: ConnectivityState,
  mut states: mpsc::UnboundedReceiver<ConnectivityState>,
) {
  while let Some(state) = states.recv().await {
    let was = std::mem::replace(&mut previous, state);
    if state != ConnectivityState::Online || was == ConnectivityState::Online {
      continue;
    }

    let Some(inner) = inner.upgrade() else {
      break;
    };
    if inner.state_tx.borrow().provenance != Some(Provenance::Cache) {
      continue;
    }

    info!(
      partition = %inner.descriptor.partition,
      key = %inner.descriptor.key,
      "Back online, revalidating cached value"
    );
    let outcome = Arc::clone(&inner).join_or_start().await;
    if !outcome.fetched() {
      warn!(
        partition = %inner.descriptor.partition,
        key = %inner.descriptor.key,
        ?outcome,
        "Automatic refresh after reconnect did not fetch"
      );
    }
  }
}

impl<T: Cacheable> ResourceInner<T> {
  fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  /// Apply `f` to the published state, unless the resource is gone.
  fn publish(&self, f: impl FnOnce(&mut ResourceState<T>)) {
    if !self.is_alive() {
      debug!(key = %self.descriptor.key, "Discarding result for dropped resource");
      return;
    }
    self.state_tx.send_modify(f);
  }

  fn publish_cached(&self, value: T) {
    self.publish(|s| {
      s.value = Some(value);
      s.provenance = Some(Provenance::Cache);
      s.loading = false;
      s.last_error = None;
    });
  }

  /// Publish a value read at startup, unless a fetch already landed.
  ///
  /// The check and the write happen under the channel lock, so a network
  /// result published concurrently is never overwritten by older disk data.
  fn publish_initial_cache(&self, value: T) {
    if !self.is_alive() {
      debug!(key = %self.descriptor.key, "Discarding result for dropped resource");
      return;
    }
    self.state_tx.send_if_modified(|s| {
      if s.provenance == Some(Provenance::Network) {
        return false;
      }
      s.value = Some(value);
      s.provenance = Some(Provenance::Cache);
      s.loading = false;
      s.last_error = None;
      true
    });
  }

  /// Nothing to show: drop whatever value is still published and say why.
  fn publish_empty(&self, error: ResourceError) {
    self.publish(|s| {
      s.value = None;
      s.provenance = None;
      s.loading = false;
      s.last_error = Some(error);
    });
  }

  /// Cache lookup in which any storage failure counts as a miss.
  async fn read_cache(&self) -> Option<T> {
    let d = &self.descriptor;
    match self.store.get::<T>(&d.partition, &d.key).await {
      Ok(value) => value,
      Err(e) => {
        warn!(
          partition = %d.partition,
          key = %d.key,
          error = %e,
          "Cache read failed, treating as a miss"
        );
        None
      }
    }
  }

  async fn initialize(self: Arc<Self>) {
    let connectivity = self.monitor.current_state();

    // Online: start the fetch now so it runs alongside the cache read.
    let network = (connectivity == ConnectivityState::Online)
      .then(|| Arc::clone(&self).join_or_start());

    let cached = self.read_cache().await;
    let had_cache = cached.is_some();
    if let Some(value) = cached {
      self.publish_initial_cache(value);
    }

    match (network, had_cache, connectivity) {
      (Some(attempt), _, _) => {
        attempt.await;
      }
      (None, false, ConnectivityState::Degraded) => {
        Arc::clone(&self).join_or_start().await;
      }
      (None, false, _) => self.publish_empty(ResourceError::NetworkUnavailable),
      (None, true, _) => {}
    }
  }

  async fn refresh(self: Arc<Self>, force_network: bool) -> RefreshOutcome {
    match self.monitor.current_state() {
      ConnectivityState::Online => return self.join_or_start().await,
      ConnectivityState::Degraded if force_network => return self.join_or_start().await,
      _ => {}
    }

    // A refresh already under way is newer than the cache; report its result.
    let pending = self
      .inflight
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    if let Some(attempt) = pending {
      return attempt.await;
    }

    match self.read_cache().await {
      Some(value) => {
        self.publish_cached(value);
        RefreshOutcome::Skipped
      }
      None if self.monitor.current_state() == ConnectivityState::Degraded => {
        // Slow beats nothing.
        self.join_or_start().await
      }
      None => {
        self.publish_empty(ResourceError::NetworkUnavailable);
        RefreshOutcome::Skipped
      }
    }
  }

  /// Join the in-flight network attempt or start a new one.
  ///
  /// The attempt runs on its own task, so it completes even if every
  /// caller stops waiting.
  fn join_or_start(self: Arc<Self>) -> InFlight {
    let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(attempt) = slot.as_ref() {
      debug!(key = %self.descriptor.key, "Joining in-flight fetch");
      return attempt.clone();
    }

    let this = Arc::clone(&self);
    let attempt = async move {
      let outcome = this.network_attempt().await;
      *this.inflight.lock().unwrap_or_else(|e| e.into_inner()) = None;
      outcome
    }
    .boxed()
    .shared();

    *slot = Some(attempt.clone());
    drop(slot);

    tokio::spawn(attempt.clone());
    attempt
  }

  async fn network_attempt(&self) -> RefreshOutcome {
    let d = &self.descriptor;
    self.publish(|s| s.loading = true);

    match d.fetch().await {
      Ok(value) => {
        if !self.is_alive() {
          debug!(key = %d.key, "Discarding fetch for dropped resource");
          return RefreshOutcome::Fetched;
        }
        if let Err(e) = self.store.set(&d.partition, &d.key, &value, d.ttl).await {
          warn!(
            partition = %d.partition,
            key = %d.key,
            error = %e,
            "Failed to persist fetched value"
          );
        }
        self.publish(|s| {
          s.value = Some(value);
          s.provenance = Some(Provenance::Network);
          s.loading = false;
          s.last_error = None;
        });
        RefreshOutcome::Fetched
      }
      Err(cause) => {
        warn!(partition = %d.partition, key = %d.key, %cause, "Remote fetch failed");

        match self.read_cache().await {
          Some(value) => {
            self.publish_cached(value);
            RefreshOutcome::CacheFallback
          }
          None => {
            self.publish_empty(ResourceError::FetchFailed(cause));
            RefreshOutcome::Failed
          }
        }
      }
    }
  }
}
