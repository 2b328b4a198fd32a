//! Connectivity source that probes an HTTP endpoint on a timer.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use url::Url;

use super::source::ConnectivitySource;
use super::state::{LinkQuality, PlatformSignal, PlatformSnapshot};

/// Treats "an HTTP response came back" as connected and the time it took
/// as the round-trip estimate.
///
/// For hosts with no native connectivity events (CLI tools, servers).
#[derive(Clone)]
pub struct HttpProbeSource {
  client: reqwest::Client,
  url: Url,
  interval: Duration,
}

impl HttpProbeSource {
  pub fn new(url: Url, interval: Duration, timeout: Duration) -> reqwest::Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      url,
      interval,
    })
  }

  async fn probe_once(&self) -> PlatformSnapshot {
    let started = Instant::now();
    match self.client.head(self.url.clone()).send().await {
      // Any status proves the link works; the endpoint's opinion is irrelevant.
      Ok(_) => PlatformSnapshot {
        connected: true,
        quality: LinkQuality::with_rtt(started.elapsed()),
      },
      Err(e) => {
        tracing::debug!(url = %self.url, error = %e, "Connectivity probe failed");
        PlatformSnapshot::offline()
      }
    }
  }
}

#[async_trait]
impl ConnectivitySource for HttpProbeSource {
  async fn probe(&self) -> PlatformSnapshot {
    self.probe_once().await
  }

  fn signals(&self) -> mpsc::UnboundedReceiver<PlatformSignal> {
    let (tx, rx) = mpsc::unbounded_channel();
    let source = self.clone();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(source.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick completes immediately; the monitor already probed.
      ticker.tick().await;

      loop {
        ticker.tick().await;
        let snapshot = source.probe_once().await;

        // Quality first, so a reconnect is classified with its measured RTT.
        if snapshot.connected && tx.send(PlatformSignal::Quality(snapshot.quality)).is_err() {
          break;
        }
        if tx.send(PlatformSignal::Connection(snapshot.connected)).is_err() {
          break;
        }
      }
    });

    rx
  }
}
