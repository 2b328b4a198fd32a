//! Connectivity classification.
//!
//! A [`NetworkMonitor`] turns platform signals (link up/down, round-trip
//! estimates) into one of Online, Degraded or Offline. Platforms plug in
//! through [`ConnectivitySource`].

mod http_probe;
mod monitor;
mod source;
mod state;

pub use http_probe::HttpProbeSource;
pub use monitor::{NetworkMonitor, Subscription};
pub use source::{ConnectivitySource, ManualSource, ManualSourceHandle};
pub use state::{
  classify, ConnectivityState, LinkQuality, PlatformSignal, PlatformSnapshot, SignalTracker,
  Thresholds,
};
