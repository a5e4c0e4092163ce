//! Point-to-point peer connections carrying framed [`Message`]s over TCP.
//!
//! A [`PeerConnection`] owns one stream and exchanges length-prefixed frames
//! (see [`MessageCodec`]). Every operation can be bounded by an optional
//! timeout; without one, reads block until the peer answers or hangs up.

use crate::protocol::{Message, MessageCodec, ProtocolError};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Connection state for a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  /// Connection is active and ready.
  Connected,
  /// Connection was closed by us.
  Closed,
  /// A read or write failed; the connection must not be reused.
  Broken,
}

/// Error type for connection-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
  /// I/O error.
  #[error("Network error: {0}")]
  Io(#[from] io::Error),
  /// Framing or decoding error.
  #[error("Protocol error: {0}")]
  Protocol(#[from] ProtocolError),
  /// The operation did not finish within the configured timeout.
  #[error("Connection timeout")]
  Timeout,
  /// The connection is no longer usable.
  #[error("Connection closed")]
  Closed,
}

/// A framed connection to a peer stage.
pub struct PeerConnection {
  framed: Framed<TcpStream, MessageCodec>,
  peer_addr: SocketAddr,
  timeout: Option<Duration>,
  state: ConnectionState,
}

impl PeerConnection {
  /// Connects to `host:port`. The timeout, when given, bounds the connect
  /// and every later send and receive.
  ///
  /// # Errors
  ///
  /// Returns [`ConnectionError::Timeout`] when the connect does not finish in
  /// time and [`ConnectionError::Io`] when it is refused or the host does not
  /// resolve.
  pub async fn connect(
    host: &str,
    port: u16,
    timeout_duration: Option<Duration>,
  ) -> Result<Self, ConnectionError> {
    let stream = with_deadline(timeout_duration, async {
      TcpStream::connect((host, port))
        .await
        .map_err(ConnectionError::Io)
    })
    .await?;
    Ok(Self::from_stream(stream)?.with_timeout(timeout_duration))
  }

  /// Wraps an accepted stream. No timeout is applied.
  ///
  /// # Errors
  ///
  /// Fails if the peer address of the socket cannot be read.
  pub fn from_stream(stream: TcpStream) -> Result<Self, ConnectionError> {
    let peer_addr = stream.peer_addr()?;
    Ok(Self {
      framed: Framed::new(stream, MessageCodec::new()),
      peer_addr,
      timeout: None,
      state: ConnectionState::Connected,
    })
  }

  /// Sets the timeout applied to each send and receive.
  #[must_use]
  pub fn with_timeout(mut self, timeout_duration: Option<Duration>) -> Self {
    self.timeout = timeout_duration;
    self
  }

  /// Sends one framed message.
  ///
  /// # Errors
  ///
  /// Fails on I/O errors, oversized frames, or timeout. The connection is
  /// marked broken afterwards.
  pub async fn send(&mut self, message: &Message) -> Result<(), ConnectionError> {
    self.ensure_open()?;
    let framed = &mut self.framed;
    let result = with_deadline(self.timeout, async {
      framed.send(message).await.map_err(ConnectionError::from)
    })
    .await;
    self.track(result)
  }

  /// Receives exactly one framed message.
  ///
  /// # Errors
  ///
  /// Returns [`ProtocolError::ConnectionBroken`] (wrapped) when the peer
  /// closes before a whole frame arrived, [`ConnectionError::Timeout`] when
  /// the timeout elapses.
  pub async fn recv(&mut self) -> Result<Message, ConnectionError> {
    self.ensure_open()?;
    let framed = &mut self.framed;
    let result = with_deadline(self.timeout, async {
      match framed.next().await {
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(ConnectionError::from(e)),
        None => Err(ConnectionError::Protocol(ProtocolError::ConnectionBroken)),
      }
    })
    .await;
    self.track(result)
  }

  /// Sends `message` and waits for one reply.
  ///
  /// # Errors
  ///
  /// Any error of [`PeerConnection::send`] or [`PeerConnection::recv`].
  pub async fn request(&mut self, message: &Message) -> Result<Message, ConnectionError> {
    self.send(message).await?;
    self.recv().await
  }

  /// Flushes pending frames and shuts down the write half.
  ///
  /// # Errors
  ///
  /// Fails if the shutdown itself fails.
  pub async fn close(mut self) -> Result<(), ConnectionError> {
    if self.state == ConnectionState::Connected {
      self.state = ConnectionState::Closed;
      SinkExt::<&Message>::close(&mut self.framed).await?;
    }
    Ok(())
  }

  /// Remote address of the peer.
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  /// Current connection state.
  pub fn state(&self) -> ConnectionState {
    self.state
  }

  fn ensure_open(&self) -> Result<(), ConnectionError> {
    match self.state {
      ConnectionState::Connected => Ok(()),
      ConnectionState::Closed | ConnectionState::Broken => Err(ConnectionError::Closed),
    }
  }

  fn track<T>(&mut self, result: Result<T, ConnectionError>) -> Result<T, ConnectionError> {
    if result.is_err() {
      self.state = ConnectionState::Broken;
    }
    result
  }
}

async fn with_deadline<T, F>(
  timeout_duration: Option<Duration>,
  future: F,
) -> Result<T, ConnectionError>
where
  F: Future<Output = Result<T, ConnectionError>>,
{
  match timeout_duration {
    Some(duration) => timeout(duration, future)
      .await
      .map_err(|_| ConnectionError::Timeout)?,
    None => future.await,
  }
}
