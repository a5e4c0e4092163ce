//! # Wire Protocol
//!
//! The tagged message shared by the data path and the health-check path,
//! plus the length-prefixed framing used for raw socket exchanges.
//!
//! ## Text encoding
//!
//! A [`Message`] is encoded as five fields joined with [`DELIMITER`]:
//!
//! ```text
//! <kind:int>|||<tenant_id:int>|||<origin>|||<sequence:int>|||<payload>
//! ```
//!
//! No field may contain the delimiter. This is not checked at encode time; a
//! payload that embeds `|||` comes back from [`Message::decode`] as a
//! [`ProtocolError::FieldCount`] error.
//!
//! ## Framing
//!
//! [`MessageCodec`] wraps each encoded message in a 4-byte big-endian length
//! header followed by exactly that many UTF-8 bytes. It plugs into
//! `tokio_util::codec::Framed` and friends.
//!
//! ```rust
//! use stageweave::protocol::{Message, MessageKind};
//!
//! let msg = Message::data(7, "counter", 3, "Book A,5");
//! let text = msg.encode();
//! assert_eq!(text, "1|||7|||counter|||3|||Book A,5");
//! assert_eq!(Message::decode(&text).unwrap(), msg);
//! assert_eq!(msg.kind, MessageKind::Data);
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Reserved field delimiter of the text encoding.
pub const DELIMITER: &str = "|||";

/// Number of fields in an encoded message.
pub const FIELD_COUNT: usize = 5;

/// Tenant id reserved for health-check traffic.
pub const HEALTH_TENANT: TenantId = 0;

/// Default upper bound for a single frame on the health path.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const LENGTH_HEADER: usize = 4;

/// Identifies one job/run. All downstream state is scoped by it.
pub type TenantId = u64;

/// Per `(tenant, origin)` sequence number assigned by the producer.
pub type SequenceNumber = u64;

/// Errors raised while decoding or framing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
  /// The text did not split into exactly five fields.
  #[error("expected 5 fields, found {found}")]
  FieldCount {
    /// Number of fields actually found.
    found: usize,
  },
  /// The kind field is not one of the known codes.
  #[error("unknown message kind: {0:?}")]
  UnknownKind(String),
  /// A numeric field could not be parsed.
  #[error("invalid {field}: {value:?}")]
  InvalidNumber {
    /// Name of the offending field.
    field: &'static str,
    /// Raw field text.
    value: String,
  },
  /// The body is not valid UTF-8.
  #[error("message is not valid UTF-8: {0}")]
  InvalidUtf8(#[from] std::str::Utf8Error),
  /// The peer closed the stream before a whole frame arrived.
  #[error("connection broken")]
  ConnectionBroken,
  /// A frame header announced more bytes than allowed.
  #[error("frame of {length} bytes exceeds maximum of {max}")]
  FrameTooLarge {
    /// Announced or attempted frame length.
    length: usize,
    /// Configured maximum.
    max: usize,
  },
  /// Underlying I/O failure.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Kind of a [`Message`]. The set is closed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MessageKind {
  /// A batch of rows for a tenant.
  Data,
  /// No further input for this tenant on this edge.
  EndOfStream,
  /// Cancel one tenant's job across the pipeline.
  Abort,
  /// Liveness probe sent by a peer poller.
  HealthProbe,
  /// Reply to a liveness probe.
  Alive,
}

impl MessageKind {
  /// Numeric code used on the wire.
  #[must_use]
  pub const fn code(self) -> u8 {
    match self {
      MessageKind::Data => 1,
      MessageKind::EndOfStream => 2,
      MessageKind::Abort => 3,
      MessageKind::HealthProbe => 4,
      MessageKind::Alive => 5,
    }
  }

  /// Looks up a kind by its wire code.
  #[must_use]
  pub const fn from_code(code: u8) -> Option<Self> {
    match code {
      1 => Some(MessageKind::Data),
      2 => Some(MessageKind::EndOfStream),
      3 => Some(MessageKind::Abort),
      4 => Some(MessageKind::HealthProbe),
      5 => Some(MessageKind::Alive),
      _ => None,
    }
  }

  /// True for the kinds that only travel on the health path.
  #[must_use]
  pub const fn is_health(self) -> bool {
    matches!(self, MessageKind::HealthProbe | MessageKind::Alive)
  }
}

impl Display for MessageKind {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let name = match self {
      MessageKind::Data => "DATA",
      MessageKind::EndOfStream => "END_OF_STREAM",
      MessageKind::Abort => "ABORT",
      MessageKind::HealthProbe => "HEALTH_PROBE",
      MessageKind::Alive => "ALIVE",
    };
    f.write_str(name)
  }
}

/// The unit flowing on both the data path and the health path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
  /// What this message means.
  pub kind: MessageKind,
  /// Tenant the message belongs to; [`HEALTH_TENANT`] on the health path.
  pub tenant_id: TenantId,
  /// Stable name of the producing stage.
  pub origin: String,
  /// Sequence number assigned by the producer.
  pub sequence: SequenceNumber,
  /// Opaque text, usually a batch of CSV rows.
  pub payload: String,
}

impl Message {
  /// Creates a message from its parts.
  pub fn new(
    kind: MessageKind,
    tenant_id: TenantId,
    origin: impl Into<String>,
    sequence: SequenceNumber,
    payload: impl Into<String>,
  ) -> Self {
    Self {
      kind,
      tenant_id,
      origin: origin.into(),
      sequence,
      payload: payload.into(),
    }
  }

  /// A DATA message carrying `payload`.
  pub fn data(
    tenant_id: TenantId,
    origin: impl Into<String>,
    sequence: SequenceNumber,
    payload: impl Into<String>,
  ) -> Self {
    Self::new(MessageKind::Data, tenant_id, origin, sequence, payload)
  }

  /// An END_OF_STREAM message with an empty payload.
  pub fn end_of_stream(
    tenant_id: TenantId,
    origin: impl Into<String>,
    sequence: SequenceNumber,
  ) -> Self {
    Self::new(MessageKind::EndOfStream, tenant_id, origin, sequence, "")
  }

  /// An ABORT message with an empty payload.
  pub fn abort(tenant_id: TenantId, origin: impl Into<String>, sequence: SequenceNumber) -> Self {
    Self::new(MessageKind::Abort, tenant_id, origin, sequence, "")
  }

  /// A HEALTH_PROBE sent by `origin`.
  pub fn health_probe(origin: impl Into<String>) -> Self {
    Self::new(MessageKind::HealthProbe, HEALTH_TENANT, origin, 0, "")
  }

  /// An ALIVE reply sent by `origin`.
  pub fn alive(origin: impl Into<String>) -> Self {
    Self::new(MessageKind::Alive, HEALTH_TENANT, origin, 0, "")
  }

  /// Encodes the message into its text form.
  #[must_use]
  pub fn encode(&self) -> String {
    format!(
      "{kind}{d}{tenant}{d}{origin}{d}{seq}{d}{payload}",
      kind = self.kind.code(),
      tenant = self.tenant_id,
      origin = self.origin,
      seq = self.sequence,
      payload = self.payload,
      d = DELIMITER,
    )
  }

  /// Decodes a message from its text form.
  ///
  /// # Errors
  ///
  /// Returns a [`ProtocolError`] when the text does not hold exactly five
  /// fields, the kind code is unknown, or a numeric field does not parse.
  pub fn decode(text: &str) -> Result<Self, ProtocolError> {
    let fields: Vec<&str> = text.split(DELIMITER).collect();
    let [kind, tenant, origin, sequence, payload] = fields.as_slice() else {
      return Err(ProtocolError::FieldCount {
        found: fields.len(),
      });
    };

    let kind = kind
      .parse::<u8>()
      .ok()
      .and_then(MessageKind::from_code)
      .ok_or_else(|| ProtocolError::UnknownKind((*kind).to_string()))?;

    Ok(Self {
      kind,
      tenant_id: parse_number("tenant_id", tenant)?,
      origin: (*origin).to_string(),
      sequence: parse_number("sequence", sequence)?,
      payload: (*payload).to_string(),
    })
  }

  /// Decodes a raw broker or socket body.
  ///
  /// # Errors
  ///
  /// Fails on non-UTF-8 input or on any [`Message::decode`] error.
  pub fn decode_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
    Self::decode(std::str::from_utf8(raw)?)
  }
}

impl FromStr for Message {
  type Err = ProtocolError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::decode(s)
  }
}

impl Display for Message {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} tenant={} origin={} seq={}",
      self.kind, self.tenant_id, self.origin, self.sequence
    )
  }
}

fn parse_number(field: &'static str, value: &str) -> Result<u64, ProtocolError> {
  value.parse::<u64>().map_err(|_| ProtocolError::InvalidNumber {
    field,
    value: value.to_string(),
  })
}

/// Length-prefixed framing for [`Message`]s over a byte stream.
///
/// The header stays in the read buffer until the whole frame has arrived, so
/// a stream that ends with any buffered bytes is reported as
/// [`ProtocolError::ConnectionBroken`].
#[derive(Clone, Debug)]
pub struct MessageCodec {
  max_frame_length: usize,
}

impl MessageCodec {
  /// Creates a codec with [`DEFAULT_MAX_FRAME_LENGTH`].
  #[must_use]
  pub fn new() -> Self {
    Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
  }

  /// Creates a codec that rejects frames longer than `max_frame_length`.
  #[must_use]
  pub fn with_max_frame_length(max_frame_length: usize) -> Self {
    Self {
      max_frame_length: max_frame_length.min(u32::MAX as usize),
    }
  }

  /// Maximum accepted frame length in bytes.
  #[must_use]
  pub fn max_frame_length(&self) -> usize {
    self.max_frame_length
  }
}

impl Default for MessageCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl Decoder for MessageCodec {
  type Item = Message;
  type Error = ProtocolError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    if src.len() < LENGTH_HEADER {
      return Ok(None);
    }

    let mut header = [0u8; LENGTH_HEADER];
    header.copy_from_slice(&src[..LENGTH_HEADER]);
    let length = u32::from_be_bytes(header) as usize;
    if length > self.max_frame_length {
      return Err(ProtocolError::FrameTooLarge {
        length,
        max: self.max_frame_length,
      });
    }

    if src.len() < LENGTH_HEADER + length {
      src.reserve(LENGTH_HEADER + length - src.len());
      return Ok(None);
    }

    src.advance(LENGTH_HEADER);
    let frame = src.split_to(length);
    Message::decode_bytes(&frame).map(Some)
  }

  fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    match self.decode(buf)? {
      Some(message) => Ok(Some(message)),
      None if buf.is_empty() => Ok(None),
      None => Err(ProtocolError::ConnectionBroken),
    }
  }
}

impl Encoder<Message> for MessageCodec {
  type Error = ProtocolError;

  fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    <Self as Encoder<&Message>>::encode(self, &item, dst)
  }
}

impl Encoder<&Message> for MessageCodec {
  type Error = ProtocolError;

  fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let text = item.encode();
    if text.len() > self.max_frame_length {
      return Err(ProtocolError::FrameTooLarge {
        length: text.len(),
        max: self.max_frame_length,
      });
    }
    dst.reserve(LENGTH_HEADER + text.len());
    dst.put_u32(text.len() as u32);
    dst.extend_from_slice(text.as_bytes());
    Ok(())
  }
}
