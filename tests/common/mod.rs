#![allow(dead_code)]

use futures::StreamExt;
use stageweave::broker::{Broker, InMemoryBroker};
use stageweave::checkpoint::CheckpointStore;
use stageweave::context::StageContext;
use stageweave::protocol::Message;
use stageweave::runtime::{OperatorRuntime, Outcome, Reducer, RuntimeConfig};
use std::sync::Arc;

/// Builds a runtime for `stage` recovered from `store`.
pub fn runtime<R: Reducer>(
  stage: &str,
  reducer: R,
  broker: &InMemoryBroker,
  store: Arc<dyn CheckpointStore>,
  config: RuntimeConfig,
) -> OperatorRuntime<R, InMemoryBroker> {
  let context = StageContext::recover(stage, store).unwrap();
  OperatorRuntime::new(reducer, broker.clone(), context, config)
}

/// Handles every message currently waiting on the runtime's input queue.
pub async fn pump<R: Reducer>(rt: &mut OperatorRuntime<R, InMemoryBroker>) -> Vec<Outcome> {
  let broker = rt.broker().clone();
  let queue = rt.config().input_queue.clone();
  let ready = broker.ready_count(&queue).await;
  let mut stream = broker.consume(&queue).await.unwrap();
  let mut outcomes = Vec::with_capacity(ready);
  for _ in 0..ready {
    let delivery = stream.next().await.unwrap().unwrap();
    outcomes.push(rt.handle_delivery(&delivery).await.unwrap());
  }
  outcomes
}

/// Puts `messages` on `queue` in order.
pub async fn send_all(broker: &InMemoryBroker, queue: &str, messages: &[Message]) {
  for message in messages {
    broker.inject(queue, message.encode()).await;
  }
}

/// Drains `queue` and decodes every message.
pub async fn drain_messages(broker: &InMemoryBroker, queue: &str) -> Vec<Message> {
  broker
    .drain(queue)
    .await
    .iter()
    .map(|raw| Message::decode(raw).unwrap())
    .collect()
}
