//! Single source of truth for connectivity.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::source::ConnectivitySource;
use super::state::{classify, ConnectivityState, SignalTracker, Thresholds};

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

/// Classifies connectivity from a [`ConnectivitySource`] and notifies
/// listeners when the classification changes.
///
/// Cheap to clone; clones observe the same state. The background task that
/// consumes platform signals stops when the last clone is dropped.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<MonitorInner>,
}

struct MonitorInner {
  state_tx: watch::Sender<ConnectivityState>,
  thresholds: Thresholds,
  listeners: Mutex<Listeners>,
  task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Listeners {
  next_id: u64,
  entries: BTreeMap<u64, Listener>,
}

impl NetworkMonitor {
  /// Probe the source for the initial state, then follow its signals.
  pub async fn start<S>(source: S, thresholds: Thresholds) -> Self
  where
    S: ConnectivitySource + 'static,
  {
    // Subscribe before probing so nothing between the two is missed.
    let mut signals = source.signals();
    let initial = source.probe().await;

    let monitor = Self::with_state(classify(&initial, &thresholds), thresholds);
    let weak = Arc::downgrade(&monitor.inner);
    let mut tracker = SignalTracker::new(initial);

    let task = tokio::spawn(async move {
      // Keep the source alive for as long as signals are consumed.
      let _source = source;
      while let Some(signal) = signals.recv().await {
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let snapshot = tracker.apply(signal);
        inner.publish(classify(&snapshot, &inner.thresholds));
      }
    });

    *monitor.inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    monitor
  }

  /// A monitor that reports a fixed state and never changes on its own.
  pub fn fixed(state: ConnectivityState) -> Self {
    Self::with_state(state, Thresholds::default())
  }

  fn with_state(initial: ConnectivityState, thresholds: Thresholds) -> Self {
    info!(state = %initial, "Network monitor started");

    let (state_tx, _) = watch::channel(initial);
    Self {
      inner: Arc::new(MonitorInner {
        state_tx,
        thresholds,
        listeners: Mutex::new(Listeners::default()),
        task: Mutex::new(None),
      }),
    }
  }

  /// Latest classification. Never blocks on I/O.
  pub fn current_state(&self) -> ConnectivityState {
    *self.inner.state_tx.borrow()
  }

  /// Receiver that yields every state change, for async consumers.
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.state_tx.subscribe()
  }

  /// Register `callback` for state changes.
  ///
  /// The listener stays attached while the returned guard is alive and is
  /// detached when the guard drops, on every exit path of its owner.
  #[must_use = "dropping the subscription detaches the listener immediately"]
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(ConnectivityState) + Send + Sync + 'static,
  {
    let mut listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
    let id = listeners.next_id;
    listeners.next_id += 1;
    listeners.entries.insert(id, Arc::new(callback));

    Subscription {
      monitor: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Override the classification, e.g. from a host's own "airplane mode" toggle.
  pub fn force_state(&self, state: ConnectivityState) {
    self.inner.publish(state);
  }

  /// Number of attached listeners.
  pub fn listener_count(&self) -> usize {
    self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .entries
      .len()
  }
}

impl MonitorInner {
  /// Store the new state and notify listeners, but only on a real change.
  fn publish(&self, state: ConnectivityState) {
    let mut previous = state;
    let changed = self.state_tx.send_if_modified(|current| {
      if *current == state {
        return false;
      }
      previous = *current;
      *current = state;
      true
    });
    if !changed {
      return;
    }

    info!(from = %previous, to = %state, "Connectivity changed");

    // Call outside the lock so a listener may unsubscribe itself.
    let listeners: Vec<Listener> = self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .entries
      .values()
      .cloned()
      .collect();
    for listener in listeners {
      (*listener)(state);
    }
  }
}

impl Drop for MonitorInner {
  fn drop(&mut self) {
    if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
      task.abort();
    }
  }
}

/// Keeps a listener attached to a [`NetworkMonitor`]. Dropping it detaches.
#[derive(Debug)]
pub struct Subscription {
  monitor: Weak<MonitorInner>,
  id: u64,
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.monitor.upgrade() {
      inner
        .listeners
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .entries
        .remove(&self.id);
    }
  }
}

impl std::fmt::Debug for NetworkMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NetworkMonitor")
      .field("state", &self.current_state())
      .field("thresholds", &self.inner.thresholds)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::source::ManualSource;
  use crate::network::state::PlatformSnapshot;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn thresholds() -> Thresholds {
    Thresholds {
      degraded_rtt: Duration::from_millis(400),
      min_downlink_mbps: None,
    }
  }

  async fn wait_for(monitor: &NetworkMonitor, state: ConnectivityState) {
    let mut rx = monitor.watch();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
      .await
      .expect("timed out waiting for state")
      .expect("monitor dropped");
  }

  #[tokio::test]
  async fn test_initial_state_from_probe() {
    let (source, _handle) = ManualSource::new(PlatformSnapshot::offline());
    let monitor = NetworkMonitor::start(source, thresholds()).await;
    assert_eq!(monitor.current_state(), ConnectivityState::Offline);
  }

  #[tokio::test]
  async fn test_state_machine_transitions() {
    let (source, handle) = ManualSource::new(PlatformSnapshot::online());
    let monitor = NetworkMonitor::start(source, thresholds()).await;
    assert_eq!(monitor.current_state(), ConnectivityState::Online);

    handle.report_rtt(Duration::from_millis(900));
    wait_for(&monitor, ConnectivityState::Degraded).await;

    handle.report_rtt(Duration::from_millis(100));
    wait_for(&monitor, ConnectivityState::Online).await;

    handle.report_rtt(Duration::from_millis(900));
    wait_for(&monitor, ConnectivityState::Degraded).await;

    handle.set_connected(false);
    wait_for(&monitor, ConnectivityState::Offline).await;

    // Quality reports cannot lift an offline link.
    handle.report_rtt(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(monitor.current_state(), ConnectivityState::Offline);

    handle.set_connected(true);
    wait_for(&monitor, ConnectivityState::Online).await;
  }

  #[tokio::test]
  async fn test_notifies_only_on_change() {
    let (source, handle) = ManualSource::new(PlatformSnapshot::online());
    let monitor = NetworkMonitor::start(source, thresholds()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _sub = monitor.subscribe(move |state| seen_clone.lock().unwrap().push(state));

    handle.set_connected(true);
    handle.report_rtt(Duration::from_millis(50));
    handle.set_connected(false);
    handle.set_connected(false);
    handle.set_connected(true);
    wait_for(&monitor, ConnectivityState::Online).await;

    // Give the consumer task a chance to drain anything left.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
      *seen.lock().unwrap(),
      vec![ConnectivityState::Offline, ConnectivityState::Online]
    );
  }

  #[tokio::test]
  async fn test_subscription_guard_detaches() {
    let monitor = NetworkMonitor::fixed(ConnectivityState::Online);
    let calls = Arc::new(AtomicUsize::new(0));

    {
      let calls = calls.clone();
      let _sub = monitor.subscribe(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
      });
      assert_eq!(monitor.listener_count(), 1);
      monitor.force_state(ConnectivityState::Offline);
    }

    assert_eq!(monitor.listener_count(), 0);
    monitor.force_state(ConnectivityState::Online);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_subscription_outliving_monitor_is_harmless() {
    let monitor = NetworkMonitor::fixed(ConnectivityState::Online);
    let sub = monitor.subscribe(|_| {});
    drop(monitor);
    drop(sub);
  }

  #[tokio::test]
  async fn test_fixed_monitor_reports_given_state() {
    let monitor = NetworkMonitor::fixed(ConnectivityState::Degraded);
    assert_eq!(monitor.current_state(), ConnectivityState::Degraded);
  }
}
