use super::{Broker, BrokerError, Delivery, DeliveryStream, DeliveryTag};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Debug)]
struct Pending {
  body: Vec<u8>,
  redelivered: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
  routes: HashMap<String, Vec<String>>,
  ready: HashMap<String, VecDeque<Pending>>,
  unacked: BTreeMap<DeliveryTag, (String, Vec<u8>)>,
  next_tag: DeliveryTag,
  fail_publishes: bool,
}

impl BrokerState {
  fn targets(&self, routing_key: &str) -> Vec<String> {
    match self.routes.get(routing_key) {
      Some(queues) if !queues.is_empty() => queues.clone(),
      _ => vec![routing_key.to_string()],
    }
  }

  fn take_next(&mut self, queue: &str) -> Option<Delivery> {
    let pending = self.ready.get_mut(queue)?.pop_front()?;
    self.next_tag += 1;
    let tag = self.next_tag;
    self
      .unacked
      .insert(tag, (queue.to_string(), pending.body.clone()));
    Some(Delivery {
      tag,
      queue: queue.to_string(),
      body: pending.body,
      redelivered: pending.redelivered,
    })
  }
}

#[derive(Debug, Default)]
struct Shared {
  state: Mutex<BrokerState>,
  notify: Notify,
}

/// In-process broker with named queues, manual acknowledgment, and
/// redelivery of unacknowledged messages.
///
/// Clones share the same queues and the same connection, so a test can keep
/// a handle while a runtime owns another. [`InMemoryBroker::reconnect`] opens
/// a new connection to the same queues, the way a restarted stage would.
/// Publishing to a routing key with no binding delivers to the queue of the
/// same name.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
  shared: Arc<Shared>,
  closed: Arc<AtomicBool>,
}

impl InMemoryBroker {
  /// Creates an empty broker.
  pub fn new() -> Self {
    Self::default()
  }

  /// A new, open connection to the same queues.
  pub fn reconnect(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      closed: Arc::default(),
    }
  }

  /// True once this connection was closed.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Puts a raw body directly on `queue`, bypassing routing.
  pub async fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
    let mut state = self.shared.state.lock().await;
    state
      .ready
      .entry(queue.to_string())
      .or_default()
      .push_back(Pending {
        body: body.into(),
        redelivered: false,
      });
    drop(state);
    self.shared.notify.notify_waiters();
  }

  /// Simulates a consumer disconnect: every unacknowledged delivery goes back
  /// to the front of its queue, flagged as redelivered. Returns how many were
  /// requeued.
  pub async fn recover(&self) -> usize {
    let mut state = self.shared.state.lock().await;
    let unacked = std::mem::take(&mut state.unacked);
    let count = unacked.len();
    for (_, (queue, body)) in unacked.into_iter().rev() {
      state
        .ready
        .entry(queue)
        .or_default()
        .push_front(Pending {
          body,
          redelivered: true,
        });
    }
    drop(state);
    debug!(requeued = count, "Requeued unacknowledged deliveries");
    self.shared.notify.notify_waiters();
    count
  }

  /// Removes and returns every ready message of `queue` as text.
  pub async fn drain(&self, queue: &str) -> Vec<String> {
    let mut state = self.shared.state.lock().await;
    state
      .ready
      .get_mut(queue)
      .map(|pending| {
        pending
          .drain(..)
          .map(|p| String::from_utf8_lossy(&p.body).into_owned())
          .collect()
      })
      .unwrap_or_default()
  }

  /// Number of messages waiting on `queue`.
  pub async fn ready_count(&self, queue: &str) -> usize {
    let state = self.shared.state.lock().await;
    state.ready.get(queue).map_or(0, VecDeque::len)
  }

  /// Number of deliveries handed out and not yet acknowledged.
  pub async fn unacked_count(&self) -> usize {
    self.shared.state.lock().await.unacked.len()
  }

  /// Makes every following publish fail (or succeed again).
  pub async fn set_fail_publishes(&self, fail: bool) {
    self.shared.state.lock().await.fail_publishes = fail;
  }
}

#[async_trait]
impl Broker for InMemoryBroker {
  async fn bind(
    &self,
    exchange: &str,
    bindings: &BTreeMap<String, Vec<String>>,
  ) -> Result<(), BrokerError> {
    if self.is_closed() {
      return Err(BrokerError::Closed);
    }
    let mut state = self.shared.state.lock().await;
    for (queue, keys) in bindings {
      state.ready.entry(queue.clone()).or_default();
      for key in keys {
        let queues = state.routes.entry(key.clone()).or_default();
        if !queues.contains(queue) {
          queues.push(queue.clone());
        }
      }
    }
    debug!(exchange = %exchange, queues = bindings.len(), "Bound exchange");
    Ok(())
  }

  async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
    if self.is_closed() {
      return Err(BrokerError::Closed);
    }
    let shared = Arc::clone(&self.shared);
    let closed = Arc::clone(&self.closed);
    let queue = queue.to_string();

    Ok(Box::pin(async_stream::stream! {
      loop {
        let notified = shared.notify.notified();
        let next = shared.state.lock().await.take_next(&queue);
        match next {
          Some(delivery) => yield Ok::<Delivery, BrokerError>(delivery),
          None if closed.load(Ordering::SeqCst) => break,
          None => notified.await,
        }
      }
    }))
  }

  async fn publish(&self, queue: &str, body: &str) -> Result<(), BrokerError> {
    if self.is_closed() {
      return Err(BrokerError::Closed);
    }
    let mut state = self.shared.state.lock().await;
    if state.fail_publishes {
      return Err(BrokerError::Unavailable(format!(
        "publish to {queue} rejected"
      )));
    }
    for target in state.targets(queue) {
      state.ready.entry(target).or_default().push_back(Pending {
        body: body.as_bytes().to_vec(),
        redelivered: false,
      });
    }
    drop(state);
    self.shared.notify.notify_waiters();
    Ok(())
  }

  async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
    let mut state = self.shared.state.lock().await;
    state
      .unacked
      .remove(&tag)
      .map(|_| ())
      .ok_or(BrokerError::UnknownDeliveryTag(tag))
  }

  async fn close(&self) -> Result<(), BrokerError> {
    self.closed.store(true, Ordering::SeqCst);
    self.shared.notify.notify_waiters();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::StreamExt;
  use std::time::Duration;

  #[tokio::test]
  async fn publish_routes_through_bindings() {
    let broker = InMemoryBroker::new();
    let bindings = BTreeMap::from([
      ("sorter_0".to_string(), vec!["0".to_string()]),
      ("sorter_1".to_string(), vec!["1".to_string()]),
    ]);
    broker.bind("grouper_exchange", &bindings).await.unwrap();

    broker.publish("1", "hello").await.unwrap();
    broker.publish("unbound", "direct").await.unwrap();
    assert_eq!(broker.drain("sorter_1").await, vec!["hello"]);
    assert_eq!(broker.ready_count("sorter_0").await, 0);
    assert_eq!(broker.drain("unbound").await, vec!["direct"]);
  }

  #[tokio::test]
  async fn unacked_deliveries_come_back_flagged() {
    let broker = InMemoryBroker::new();
    broker.inject("input", "first").await;
    broker.inject("input", "second").await;

    let mut stream = broker.consume("input").await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert!(!first.redelivered);
    broker.ack(first.tag).await.unwrap();
    assert_eq!(broker.unacked_count().await, 1);

    assert_eq!(broker.recover().await, 1);
    let again = stream.next().await.unwrap().unwrap();
    assert_eq!(again.body, second.body);
    assert!(again.redelivered);
    assert_ne!(again.tag, second.tag);
  }

  #[tokio::test]
  async fn ack_of_unknown_tag_fails() {
    let broker = InMemoryBroker::new();
    assert!(matches!(
      broker.ack(42).await,
      Err(BrokerError::UnknownDeliveryTag(42))
    ));
  }

  #[tokio::test]
  async fn consumer_wakes_on_publish_and_ends_on_close() {
    let broker = InMemoryBroker::new();
    let mut stream = broker.consume("input").await.unwrap();

    let publisher = broker.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      publisher.publish("input", "late").await.unwrap();
      publisher.close().await.unwrap();
    });

    let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(delivery.body, b"late");
    assert!(stream.next().await.is_none());
    assert!(matches!(
      broker.publish("input", "x").await,
      Err(BrokerError::Closed)
    ));
  }

  #[tokio::test]
  async fn reconnect_opens_a_new_connection_to_the_same_queues() {
    let broker = InMemoryBroker::new();
    broker.publish("input", "kept").await.unwrap();
    broker.close().await.unwrap();
    assert!(broker.is_closed());
    assert!(matches!(
      broker.consume("input").await,
      Err(BrokerError::Closed)
    ));

    let reopened = broker.reconnect();
    assert!(!reopened.is_closed());
    let mut stream = reopened.consume("input").await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(delivery.body, b"kept");
    assert!(broker.is_closed());
  }
}
