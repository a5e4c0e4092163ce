use super::LivenessError;
use crate::protocol::{Message, MessageKind};
use crate::transport::{ConnectionError, PeerConnection};
use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answers health probes on the stage's well-known port.
///
/// Connections are served one at a time: read exactly one framed message,
/// reply with one ALIVE if it was a HEALTH_PROBE, close. No timeouts are
/// applied, and a failing connection never stops the responder.
pub struct HealthResponder {
  stage_name: String,
  listener: TcpListener,
}

impl HealthResponder {
  /// Binds the responder for `stage_name` to `addr`.
  ///
  /// # Errors
  ///
  /// [`LivenessError::Bind`] when the address cannot be bound.
  pub async fn bind(
    stage_name: impl Into<String>,
    addr: impl ToSocketAddrs + std::fmt::Debug,
  ) -> Result<Self, LivenessError> {
    let display = format!("{addr:?}");
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|source| LivenessError::Bind {
        address: display,
        source,
      })?;
    Ok(Self {
      stage_name: stage_name.into(),
      listener,
    })
  }

  /// Address the responder listens on.
  ///
  /// # Errors
  ///
  /// Fails if the socket address cannot be read.
  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Serves probes until `cancel` fires. The listener is dropped on return.
  pub async fn run(self, cancel: CancellationToken) {
    let address = self
      .local_addr()
      .map(|a| a.to_string())
      .unwrap_or_else(|_| "unknown".to_string());
    info!(stage = %self.stage_name, address = %address, "Health responder listening");

    loop {
      let accepted = tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        accepted = self.listener.accept() => accepted,
      };

      match accepted {
        Ok((stream, peer)) => {
          let served = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            served = self.serve(stream) => served,
          };
          if let Err(e) = served {
            warn!(peer = %peer, error = %e, "Health check connection failed");
          }
        }
        Err(e) => {
          warn!(error = %e, "Failed to accept health check connection");
        }
      }
    }
    info!(stage = %self.stage_name, "Health responder stopped");
  }

  async fn serve(&self, stream: tokio::net::TcpStream) -> Result<(), ConnectionError> {
    let mut connection = PeerConnection::from_stream(stream)?;
    let request = connection.recv().await?;
    if request.kind == MessageKind::HealthProbe {
      debug!(origin = %request.origin, "Answering health probe");
      connection.send(&Message::alive(&self.stage_name)).await?;
    } else {
      debug!(kind = %request.kind, origin = %request.origin, "Ignoring non-probe message");
    }
    connection.close().await
  }
}
