//! # Broker Boundary
//!
//! The publish/subscribe broker connecting stages is an external
//! collaborator. The runtime only needs the narrow surface captured by the
//! [`Broker`] trait:
//!
//! - `bind` the output exchange to its queues and routing keys,
//! - `consume` one input queue with manual acknowledgment,
//! - `publish` a text body to a queue,
//! - `ack` a delivery once its effects are persisted.
//!
//! Delivery is at-least-once: anything consumed but not acknowledged comes
//! back with [`Delivery::redelivered`] set after the consumer reconnects.
//! [`InMemoryBroker`] implements these semantics in-process.

mod memory;

pub use memory::InMemoryBroker;

use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use thiserror::Error;

/// Broker-assigned handle used to acknowledge one delivery.
pub type DeliveryTag = u64;

/// Stream of deliveries from one queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// One message handed to a consumer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Delivery {
  /// Tag to pass to [`Broker::ack`].
  pub tag: DeliveryTag,
  /// Queue the message was consumed from.
  pub queue: String,
  /// Raw body.
  pub body: Vec<u8>,
  /// True when this message was delivered before and not acknowledged.
  pub redelivered: bool,
}

/// Errors reported by a broker.
#[derive(Debug, Error)]
pub enum BrokerError {
  /// The broker connection is closed.
  #[error("broker connection closed")]
  Closed,
  /// Acknowledgment for a tag that is not outstanding.
  #[error("unknown delivery tag {0}")]
  UnknownDeliveryTag(DeliveryTag),
  /// The broker could not carry out the request.
  #[error("broker unavailable: {0}")]
  Unavailable(String),
}

/// The operations a stage needs from its message broker.
#[async_trait]
pub trait Broker: Send + Sync {
  /// Declares `exchange` and binds each queue to its routing keys.
  async fn bind(
    &self,
    exchange: &str,
    bindings: &BTreeMap<String, Vec<String>>,
  ) -> Result<(), BrokerError>;

  /// Starts consuming `queue` with manual acknowledgment.
  async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

  /// Publishes `body` under the routing key `queue`.
  async fn publish(&self, queue: &str, body: &str) -> Result<(), BrokerError>;

  /// Acknowledges a delivery; it will not be redelivered.
  async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

  /// Closes the connection. Open delivery streams end.
  async fn close(&self) -> Result<(), BrokerError>;
}
