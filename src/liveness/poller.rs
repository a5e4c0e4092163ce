use super::Reviver;
use crate::protocol::{Message, MessageKind};
use crate::transport::PeerConnection;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Probe settings shared by all pollers of a stage.
#[derive(Clone, Debug)]
pub struct PollerConfig {
  /// Origin put on outgoing probes (the polling stage's name).
  pub origin: String,
  /// Port peers answer probes on.
  pub port: u16,
  /// Pause between two probes of the same peer.
  pub interval: Duration,
  /// Bound on connect, send and receive of one probe.
  pub timeout: Duration,
}

impl Default for PollerConfig {
  fn default() -> Self {
    Self {
      origin: "health_checker".to_string(),
      port: super::DEFAULT_HEALTH_CHECK_PORT,
      interval: Duration::from_secs(5),
      timeout: Duration::from_secs(3),
    }
  }
}

/// Result of one probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeOutcome {
  /// The peer answered ALIVE.
  Alive,
  /// The peer could not be reached or answered something else.
  Unhealthy(String),
}

impl ProbeOutcome {
  /// True for [`ProbeOutcome::Alive`].
  pub fn is_alive(&self) -> bool {
    matches!(self, ProbeOutcome::Alive)
  }
}

/// What one poller knows about its peer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerStatus {
  /// Failed probes since the last successful one.
  pub consecutive_failures: u32,
  /// Revivals triggered so far.
  pub revivals: u64,
  /// When the last probe failed.
  pub last_failure_at: Option<DateTime<Utc>>,
  /// When the last probe succeeded.
  pub last_alive_at: Option<DateTime<Utc>>,
}

/// Probes one peer on an interval and revives it when a probe fails.
pub struct PeerPoller {
  peer: String,
  address: String,
  config: PollerConfig,
  reviver: Arc<dyn Reviver>,
  status: PeerStatus,
}

impl PeerPoller {
  /// Creates a poller for `peer`, reached at the host of the same name.
  pub fn new(peer: impl Into<String>, config: PollerConfig, reviver: Arc<dyn Reviver>) -> Self {
    let peer = peer.into();
    Self {
      address: peer.clone(),
      peer,
      config,
      reviver,
      status: PeerStatus::default(),
    }
  }

  /// Reaches the peer at `address` instead of its name.
  #[must_use]
  pub fn with_address(mut self, address: impl Into<String>) -> Self {
    self.address = address.into();
    self
  }

  /// Monitored peer.
  pub fn peer(&self) -> &str {
    &self.peer
  }

  /// Current status of the peer.
  pub fn status(&self) -> &PeerStatus {
    &self.status
  }

  /// Sends one HEALTH_PROBE and waits for the reply.
  pub async fn probe(&self) -> ProbeOutcome {
    let timeout = Some(self.config.timeout);
    let mut connection = match PeerConnection::connect(&self.address, self.config.port, timeout).await {
      Ok(connection) => connection,
      Err(e) => return ProbeOutcome::Unhealthy(format!("connect failed: {e}")),
    };

    let outcome = match connection
      .request(&Message::health_probe(&self.config.origin))
      .await
    {
      Ok(reply) if reply.kind == MessageKind::Alive => ProbeOutcome::Alive,
      Ok(reply) => ProbeOutcome::Unhealthy(format!("unexpected {} reply", reply.kind)),
      Err(e) => ProbeOutcome::Unhealthy(e.to_string()),
    };
    if let Err(e) = connection.close().await {
      debug!(peer = %self.peer, error = %e, "Failed to close probe connection");
    }
    outcome
  }

  /// Probes once and triggers exactly one revival if the probe failed.
  pub async fn tick(&mut self) -> ProbeOutcome {
    debug!(peer = %self.peer, "Probing peer");
    let outcome = self.probe().await;
    match &outcome {
      ProbeOutcome::Alive => {
        if self.status.consecutive_failures > 0 {
          info!(peer = %self.peer, "Peer is healthy again");
        }
        self.status.consecutive_failures = 0;
        self.status.last_alive_at = Some(Utc::now());
      }
      ProbeOutcome::Unhealthy(reason) => {
        error!(peer = %self.peer, reason = %reason, "Peer is not healthy");
        self.status.consecutive_failures += 1;
        self.status.last_failure_at = Some(Utc::now());
        self.status.revivals += 1;
        if let Err(e) = self.reviver.revive(&self.peer).await {
          error!(peer = %self.peer, error = %e, "Failed to revive peer");
        }
      }
    }
    outcome
  }

  /// Probes every interval until `cancel` fires. The full interval is slept
  /// after every probe, whatever its outcome.
  pub async fn run(mut self, cancel: CancellationToken) {
    info!(peer = %self.peer, interval = ?self.config.interval, "Peer poller started");
    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = self.tick() => {}
      }
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(self.config.interval) => {}
      }
    }
    debug!(peer = %self.peer, "Peer poller stopped");
  }
}
