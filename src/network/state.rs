//! Connectivity states and the rules that classify platform signals.

use std::fmt;
use std::time::Duration;

/// Current connectivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
  Online,
  /// Connected, but the link is too slow to be worth a background fetch
  Degraded,
  Offline,
}

impl fmt::Display for ConnectivityState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ConnectivityState::Online => "online",
      ConnectivityState::Degraded => "degraded",
      ConnectivityState::Offline => "offline",
    };
    f.write_str(s)
  }
}

/// Link-quality estimates reported by the platform. Any field may be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkQuality {
  pub rtt: Option<Duration>,
  pub downlink_mbps: Option<f64>,
}

impl LinkQuality {
  pub fn with_rtt(rtt: Duration) -> Self {
    Self {
      rtt: Some(rtt),
      downlink_mbps: None,
    }
  }
}

/// What the platform reports right now.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlatformSnapshot {
  pub connected: bool,
  pub quality: LinkQuality,
}

impl PlatformSnapshot {
  pub fn online() -> Self {
    Self {
      connected: true,
      quality: LinkQuality::default(),
    }
  }

  pub fn offline() -> Self {
    Self::default()
  }
}

/// A change reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlatformSignal {
  /// The link came up or went down
  Connection(bool),
  /// A fresh link-quality estimate
  Quality(LinkQuality),
}

/// Thresholds that separate Online from Degraded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  /// Round trips slower than this are Degraded
  pub degraded_rtt: Duration,
  /// Optional bandwidth floor; below it the link is Degraded
  pub min_downlink_mbps: Option<f64>,
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      degraded_rtt: Duration::from_millis(1500),
      min_downlink_mbps: None,
    }
  }
}

/// Classify a snapshot. A disconnected link is Offline whatever the quality says.
pub fn classify(snapshot: &PlatformSnapshot, thresholds: &Thresholds) -> ConnectivityState {
  if !snapshot.connected {
    return ConnectivityState::Offline;
  }

  let slow_rtt = snapshot
    .quality
    .rtt
    .is_some_and(|rtt| rtt > thresholds.degraded_rtt);
  let thin_pipe = match (snapshot.quality.downlink_mbps, thresholds.min_downlink_mbps) {
    (Some(downlink), Some(floor)) => downlink < floor,
    _ => false,
  };

  if slow_rtt || thin_pipe {
    ConnectivityState::Degraded
  } else {
    ConnectivityState::Online
  }
}

/// Folds platform signals into the latest snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SignalTracker {
  snapshot: PlatformSnapshot,
}

impl SignalTracker {
  pub fn new(snapshot: PlatformSnapshot) -> Self {
    Self { snapshot }
  }

  pub fn snapshot(&self) -> PlatformSnapshot {
    self.snapshot
  }

  /// Apply a signal and return the updated snapshot.
  pub fn apply(&mut self, signal: PlatformSignal) -> PlatformSnapshot {
    match signal {
      PlatformSignal::Connection(connected) => {
        if !connected {
          // Estimates from a dropped link say nothing about the next one.
          self.snapshot.quality = LinkQuality::default();
        }
        self.snapshot.connected = connected;
      }
      PlatformSignal::Quality(quality) => self.snapshot.quality = quality,
    }
    self.snapshot
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn snapshot(connected: bool, rtt_ms: Option<u64>) -> PlatformSnapshot {
    PlatformSnapshot {
      connected,
      quality: LinkQuality {
        rtt: rtt_ms.map(Duration::from_millis),
        downlink_mbps: None,
      },
    }
  }

  #[test]
  fn test_offline_wins_over_quality() {
    let t = Thresholds::default();
    assert_eq!(classify(&snapshot(false, Some(10)), &t), ConnectivityState::Offline);
    assert_eq!(classify(&snapshot(false, Some(9000)), &t), ConnectivityState::Offline);
  }

  #[test]
  fn test_rtt_threshold() {
    let t = Thresholds {
      degraded_rtt: Duration::from_millis(500),
      min_downlink_mbps: None,
    };
    assert_eq!(classify(&snapshot(true, None), &t), ConnectivityState::Online);
    assert_eq!(classify(&snapshot(true, Some(500)), &t), ConnectivityState::Online);
    assert_eq!(classify(&snapshot(true, Some(501)), &t), ConnectivityState::Degraded);
  }

  #[test]
  fn test_downlink_floor() {
    let t = Thresholds {
      degraded_rtt: Duration::from_secs(1),
      min_downlink_mbps: Some(1.0),
    };
    let mut s = snapshot(true, Some(50));
    s.quality.downlink_mbps = Some(0.4);
    assert_eq!(classify(&s, &t), ConnectivityState::Degraded);
    s.quality.downlink_mbps = Some(5.0);
    assert_eq!(classify(&s, &t), ConnectivityState::Online);
  }

  #[test]
  fn test_tracker_resets_quality_on_reconnect() {
    let mut tracker = SignalTracker::new(snapshot(true, None));
    tracker.apply(PlatformSignal::Quality(LinkQuality::with_rtt(Duration::from_secs(3))));
    tracker.apply(PlatformSignal::Connection(false));
    let s = tracker.apply(PlatformSignal::Connection(true));

    assert!(s.connected);
    assert_eq!(s.quality, LinkQuality::default());
  }

  #[test]
  fn test_tracker_keeps_quality_reported_before_connect() {
    let mut tracker = SignalTracker::new(snapshot(false, None));
    tracker.apply(PlatformSignal::Quality(LinkQuality::with_rtt(Duration::from_secs(3))));
    let s = tracker.apply(PlatformSignal::Connection(true));

    assert_eq!(classify(&s, &Thresholds::default()), ConnectivityState::Degraded);
  }

  #[test]
  fn test_tracker_keeps_quality_on_repeated_connection_signal() {
    let mut tracker = SignalTracker::new(snapshot(true, Some(20)));
    let s = tracker.apply(PlatformSignal::Connection(true));
    assert_eq!(s.quality.rtt, Some(Duration::from_millis(20)));
  }
}
