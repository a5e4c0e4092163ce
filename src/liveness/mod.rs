//! # Liveness Monitor
//!
//! Detects and restarts unresponsive stages. Every stage runs a
//! [`HealthResponder`] on a well-known port; a monitoring stage additionally
//! runs one [`PeerPoller`] per roster peer. A poller probes its peer every
//! interval and asks its [`Reviver`] to restart the peer whenever a probe
//! fails.
//!
//! All tasks are tied to one `CancellationToken`. The monitor shares nothing
//! with the data path except the process lifetime.

mod poller;
mod responder;
mod revive;
mod roster;

pub use poller::{PeerPoller, PeerStatus, PollerConfig, ProbeOutcome};
pub use responder::HealthResponder;
pub use revive::{CommandReviver, RecordingReviver, Reviver};
pub use roster::Roster;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default port of the health responder.
pub const DEFAULT_HEALTH_CHECK_PORT: u16 = 5000;

/// Errors raised by the liveness monitor.
#[derive(Debug, Error)]
pub enum LivenessError {
  /// The responder could not bind its port.
  #[error("failed to bind health responder on {address}: {source}")]
  Bind {
    /// Requested address.
    address: String,
    /// Bind error.
    #[source]
    source: std::io::Error,
  },
  /// The roster file could not be read.
  #[error("failed to read roster {path:?}: {source}")]
  Roster {
    /// Roster path.
    path: PathBuf,
    /// Read error.
    #[source]
    source: std::io::Error,
  },
  /// A revival attempt failed.
  #[error("failed to revive {peer}: {reason}")]
  Revive {
    /// Peer that was being revived.
    peer: String,
    /// What went wrong.
    reason: String,
  },
}

/// Settings of a [`LivenessMonitor`].
#[derive(Clone, Debug)]
pub struct LivenessConfig {
  /// This stage's name: ALIVE origin and excluded roster entry.
  pub stage_name: String,
  /// Host the responder binds to.
  pub bind_host: String,
  /// Port the responder binds to and peers are probed on.
  pub port: u16,
  /// Pause between probes of one peer.
  pub interval: Duration,
  /// Bound on each probe's connect, send and receive.
  pub timeout: Duration,
}

impl LivenessConfig {
  /// Creates a config for `stage_name` with default port and timings.
  pub fn new(stage_name: impl Into<String>) -> Self {
    let defaults = PollerConfig::default();
    Self {
      stage_name: stage_name.into(),
      bind_host: "0.0.0.0".to_string(),
      port: DEFAULT_HEALTH_CHECK_PORT,
      interval: defaults.interval,
      timeout: defaults.timeout,
    }
  }

  /// Sets the responder bind host.
  #[must_use]
  pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
    self.bind_host = host.into();
    self
  }

  /// Sets the health-check port.
  #[must_use]
  pub fn with_port(mut self, port: u16) -> Self {
    self.port = port;
    self
  }

  /// Sets the probe interval.
  #[must_use]
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Sets the probe timeout.
  #[must_use]
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Poller settings derived from this config.
  pub fn poller_config(&self) -> PollerConfig {
    PollerConfig {
      origin: self.stage_name.clone(),
      port: self.port,
      interval: self.interval,
      timeout: self.timeout,
    }
  }
}

/// Runs the health responder and one poller per roster peer.
pub struct LivenessMonitor {
  config: LivenessConfig,
  roster: Roster,
  reviver: Arc<dyn Reviver>,
}

impl LivenessMonitor {
  /// Creates a monitor. An empty roster runs only the responder.
  pub fn new(config: LivenessConfig, roster: Roster, reviver: Arc<dyn Reviver>) -> Self {
    Self {
      config,
      roster,
      reviver,
    }
  }

  /// Monitored peers.
  pub fn roster(&self) -> &Roster {
    &self.roster
  }

  /// Binds the responder and spawns every task onto a [`JoinSet`].
  ///
  /// # Errors
  ///
  /// [`LivenessError::Bind`] when the responder port is taken.
  pub async fn spawn(self, cancel: CancellationToken) -> Result<JoinSet<()>, LivenessError> {
    let responder = HealthResponder::bind(
      self.config.stage_name.clone(),
      (self.config.bind_host.as_str(), self.config.port),
    )
    .await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(responder.run(cancel.clone()));

    let poller_config = self.config.poller_config();
    for peer in self.roster.peers() {
      let poller = PeerPoller::new(peer.clone(), poller_config.clone(), Arc::clone(&self.reviver));
      tasks.spawn(poller.run(cancel.clone()));
    }

    info!(
      stage = %self.config.stage_name,
      peers = self.roster.len(),
      port = self.config.port,
      "Liveness monitor started"
    );
    Ok(tasks)
  }

  /// Runs until `cancel` fires and every task has stopped.
  ///
  /// # Errors
  ///
  /// See [`LivenessMonitor::spawn`].
  pub async fn run(self, cancel: CancellationToken) -> Result<(), LivenessError> {
    let mut tasks = self.spawn(cancel).await?;
    while let Some(result) = tasks.join_next().await {
      if let Err(e) = result {
        error!(error = %e, "Liveness task failed");
      }
    }
    info!("Liveness monitor stopped");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
  }

  #[tokio::test]
  async fn monitor_stops_on_cancel() {
    let port = free_port().await;
    let config = LivenessConfig::new("hc")
      .with_bind_host("127.0.0.1")
      .with_port(port)
      .with_interval(Duration::from_millis(20))
      .with_timeout(Duration::from_millis(50));
    let roster = Roster::from_peers(["hc", "ghost.invalid"], "hc");
    let reviver = RecordingReviver::new();
    let monitor = LivenessMonitor::new(config, roster, Arc::new(reviver.clone()));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(monitor.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert!(reviver.revived().iter().all(|p| p == "ghost.invalid"));
  }

  #[tokio::test]
  async fn busy_port_is_a_bind_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = LivenessConfig::new("hc")
      .with_bind_host("127.0.0.1")
      .with_port(port);
    let monitor = LivenessMonitor::new(config, Roster::default(), Arc::new(RecordingReviver::new()));
    let result = monitor.spawn(CancellationToken::new()).await;
    assert!(matches!(result, Err(LivenessError::Bind { .. })));
  }
}
