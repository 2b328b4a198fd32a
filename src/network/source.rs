//! Pluggable sources of platform connectivity signals.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::state::{LinkQuality, PlatformSignal, PlatformSnapshot, SignalTracker};

/// Adapter between a platform's connectivity events and the monitor.
///
/// Each target supplies its own: an OS network-change listener, a periodic
/// HTTP probe, or a test harness.
#[async_trait]
pub trait ConnectivitySource: Send + Sync {
  /// Report the platform's connectivity right now.
  async fn probe(&self) -> PlatformSnapshot;

  /// Stream of changes. The source stops producing once the receiver is dropped.
  fn signals(&self) -> mpsc::UnboundedReceiver<PlatformSignal>;
}

/// A source driven by hand through a [`ManualSourceHandle`].
///
/// Used by tests and by hosts that already receive connectivity events
/// from elsewhere and just need to forward them.
pub struct ManualSource {
  shared: Arc<ManualShared>,
}

/// Pushes signals into a [`ManualSource`].
#[derive(Clone)]
pub struct ManualSourceHandle {
  shared: Arc<ManualShared>,
}

struct ManualShared {
  tracker: Mutex<SignalTracker>,
  senders: Mutex<Vec<mpsc::UnboundedSender<PlatformSignal>>>,
}

impl ManualSource {
  pub fn new(initial: PlatformSnapshot) -> (Self, ManualSourceHandle) {
    let shared = Arc::new(ManualShared {
      tracker: Mutex::new(SignalTracker::new(initial)),
      senders: Mutex::new(Vec::new()),
    });
    (
      Self {
        shared: Arc::clone(&shared),
      },
      ManualSourceHandle { shared },
    )
  }
}

#[async_trait]
impl ConnectivitySource for ManualSource {
  async fn probe(&self) -> PlatformSnapshot {
    self
      .shared
      .tracker
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .snapshot()
  }

  fn signals(&self) -> mpsc::UnboundedReceiver<PlatformSignal> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .shared
      .senders
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(tx);
    rx
  }
}

impl ManualSourceHandle {
  /// Deliver a raw signal to every listener.
  pub fn report(&self, signal: PlatformSignal) {
    self
      .shared
      .tracker
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .apply(signal);

    let mut senders = self
      .shared
      .senders
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    senders.retain(|tx| tx.send(signal).is_ok());
  }

  pub fn set_connected(&self, connected: bool) {
    self.report(PlatformSignal::Connection(connected));
  }

  pub fn report_rtt(&self, rtt: std::time::Duration) {
    self.report(PlatformSignal::Quality(LinkQuality::with_rtt(rtt)));
  }
}
