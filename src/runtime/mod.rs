//! # Stateful Operator Runtime
//!
//! Drives one input queue through a [`Reducer`], turning the broker's
//! at-least-once delivery into effectively-exactly-once processing.
//!
//! For every delivery, strictly one at a time:
//!
//! 1. decode the body (undecodable bodies follow [`DecodeFailurePolicy`]);
//! 2. acknowledge and skip anything the ledger has already applied;
//! 3. hand the message to the reducer, which stages emissions;
//! 4. publish the emissions, commit the inbound sequence, persist the
//!    checkpoint, and only then acknowledge.
//!
//! A failure in steps 3 or 4 leaves the delivery unacknowledged, rolls the
//! context back to the last checkpoint, and stops the loop. After a restart the message is redelivered and reprocessed against
//! the last checkpoint, which assigns the same outgoing sequence numbers, so
//! downstream ledgers drop whatever was already published.

mod emitter;
mod reducer;

pub use emitter::{Emission, Emitter};
pub use reducer::{EndOfStream, Reducer, ReducerError};

use crate::broker::{Broker, BrokerError, Delivery};
use crate::checkpoint::CheckpointError;
use crate::context::StageContext;
use crate::protocol::{Message, MessageKind, ProtocolError, TenantId};
use futures::StreamExt;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with a delivery whose body does not decode.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum DecodeFailurePolicy {
  /// Stop the data path without acknowledging.
  #[default]
  Fail,
  /// Publish the raw body to `queue`, acknowledge, and continue.
  DeadLetter {
    /// Dead-letter queue name.
    queue: String,
  },
}

/// Queue wiring of one runtime.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
  /// Queue consumed by this stage.
  pub input_queue: String,
  /// Exchange the output queues are bound to.
  pub output_exchange: String,
  /// Output queues, also used as routing keys. Partitioned emissions index
  /// into this list.
  pub output_queues: Vec<String>,
  /// Handling of undecodable deliveries.
  pub decode_failure: DecodeFailurePolicy,
}

impl RuntimeConfig {
  /// Creates a config consuming `input_queue` with no outputs.
  pub fn new(input_queue: impl Into<String>) -> Self {
    Self {
      input_queue: input_queue.into(),
      ..Self::default()
    }
  }

  /// Sets the output exchange and its queues.
  #[must_use]
  pub fn with_outputs(mut self, exchange: impl Into<String>, queues: Vec<String>) -> Self {
    self.output_exchange = exchange.into();
    self.output_queues = queues;
    self
  }

  /// Sets the decode failure policy.
  #[must_use]
  pub fn with_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
    self.decode_failure = policy;
    self
  }

  /// Output bindings: each queue bound under its own name.
  pub fn bindings(&self) -> BTreeMap<String, Vec<String>> {
    self
      .output_queues
      .iter()
      .map(|queue| (queue.clone(), vec![queue.clone()]))
      .collect()
  }
}

/// Result of handling one delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
  /// The reducer ran; `emitted` messages were published.
  Applied {
    /// Number of messages published.
    emitted: usize,
  },
  /// Already applied; acknowledged without side effects.
  Duplicate,
  /// Health-path kind on the data path; acknowledged and ignored.
  Ignored,
  /// Undecodable body routed to the dead-letter queue.
  DeadLettered,
}

/// Errors that stop the data path.
#[derive(Debug, Error)]
pub enum RuntimeError {
  /// A delivery did not decode.
  #[error("undecodable message on {queue}: {source}")]
  Protocol {
    /// Queue the delivery came from.
    queue: String,
    /// Decode error.
    #[source]
    source: ProtocolError,
  },
  /// Broker consume, publish, or ack failed.
  #[error("broker error: {0}")]
  Broker(#[from] BrokerError),
  /// Persisting the checkpoint failed.
  #[error("checkpoint error: {0}")]
  Checkpoint(#[from] CheckpointError),
  /// An earlier failure left in-memory state that could not be restored
  /// from the checkpoint.
  #[error("runtime state diverged from its checkpoint")]
  Poisoned,
  /// The reducer rejected a message.
  #[error("reducer failed for tenant {tenant}: {source}")]
  Reducer {
    /// Tenant of the failing message.
    tenant: TenantId,
    /// Reducer error.
    #[source]
    source: ReducerError,
  },
}

/// Per-message driver for one stage.
pub struct OperatorRuntime<R: Reducer, B: Broker> {
  reducer: R,
  broker: B,
  context: StageContext<R::State>,
  config: RuntimeConfig,
  poisoned: bool,
}

impl<R: Reducer, B: Broker> OperatorRuntime<R, B> {
  /// Creates a runtime over an already recovered context.
  pub fn new(reducer: R, broker: B, context: StageContext<R::State>, config: RuntimeConfig) -> Self {
    Self {
      reducer,
      broker,
      context,
      config,
      poisoned: false,
    }
  }

  /// The ledger and reducer state.
  pub fn context(&self) -> &StageContext<R::State> {
    &self.context
  }

  /// The reducer.
  pub fn reducer(&self) -> &R {
    &self.reducer
  }

  /// The broker handle.
  pub fn broker(&self) -> &B {
    &self.broker
  }

  /// Queue wiring.
  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  /// Binds the output exchange to the output queues.
  ///
  /// # Errors
  ///
  /// Any broker error.
  pub async fn setup(&self) -> Result<(), RuntimeError> {
    if self.config.output_queues.is_empty() {
      return Ok(());
    }
    self
      .broker
      .bind(&self.config.output_exchange, &self.config.bindings())
      .await?;
    Ok(())
  }

  /// Consumes the input queue until it closes or `cancel` fires.
  ///
  /// # Errors
  ///
  /// The first error of [`OperatorRuntime::handle_delivery`] or of the
  /// delivery stream. The failing delivery stays unacknowledged.
  pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), RuntimeError> {
    let mut deliveries = self.broker.consume(&self.config.input_queue).await?;
    info!(
      stage = %self.context.ledger().self_origin(),
      queue = %self.config.input_queue,
      "Consuming input queue"
    );

    loop {
      let next = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          info!(queue = %self.config.input_queue, "Data path cancelled");
          return Ok(());
        }
        next = deliveries.next() => next,
      };

      let Some(delivery) = next else {
        info!(queue = %self.config.input_queue, "Input queue closed");
        return Ok(());
      };

      let delivery = delivery?;
      if let Err(e) = self.handle_delivery(&delivery).await {
        error!(
          queue = %delivery.queue,
          tag = delivery.tag,
          error = %e,
          "Stopping data path"
        );
        return Err(e);
      }
    }
  }

  /// Runs one delivery through decode, dedup, reduce, publish, persist, ack.
  ///
  /// # Errors
  ///
  /// See [`RuntimeError`]. On error the delivery is not acknowledged and the
  /// context is reloaded from the last checkpoint; if that reload fails,
  /// every later call returns [`RuntimeError::Poisoned`].
  pub async fn handle_delivery(&mut self, delivery: &Delivery) -> Result<Outcome, RuntimeError> {
    if self.poisoned {
      return Err(RuntimeError::Poisoned);
    }

    let message = match Message::decode_bytes(&delivery.body) {
      Ok(message) => message,
      Err(e) => return self.handle_undecodable(delivery, e).await,
    };

    if message.kind.is_health() {
      warn!(
        kind = %message.kind,
        origin = %message.origin,
        queue = %delivery.queue,
        "Ignoring health message on data path"
      );
      self.broker.ack(delivery.tag).await?;
      return Ok(Outcome::Ignored);
    }

    let ledger = self.context.ledger();
    if ledger.is_duplicate(message.tenant_id, &message.origin, message.sequence) {
      if message.kind != MessageKind::Abort {
        debug!(
          tenant = message.tenant_id,
          origin = %message.origin,
          sequence = message.sequence,
          last_applied = ledger.last_applied(message.tenant_id, &message.origin),
          redelivered = delivery.redelivered,
          "Skipping duplicate message"
        );
      }
      self.broker.ack(delivery.tag).await?;
      return Ok(Outcome::Duplicate);
    }

    debug!(
      kind = %message.kind,
      tenant = message.tenant_id,
      origin = %message.origin,
      sequence = message.sequence,
      "Applying message"
    );

    let emitted = match self.apply_and_persist(&message).await {
      Ok(emitted) => emitted,
      Err(e) => {
        self.roll_back();
        return Err(e);
      }
    };
    self.broker.ack(delivery.tag).await?;

    Ok(Outcome::Applied { emitted })
  }

  async fn apply_and_persist(&mut self, message: &Message) -> Result<usize, RuntimeError> {
    let emissions = self.apply(message)?;
    for emission in &emissions {
      let body = emission.message.encode();
      for queue in &emission.queues {
        self.broker.publish(queue, &body).await?;
      }
    }

    self
      .context
      .ledger_mut()
      .commit(message.tenant_id, &message.origin, message.sequence);
    self.context.persist()?;
    Ok(emissions.len())
  }

  /// Drops in-memory effects of a message that was not persisted, so a
  /// redelivery on this runtime is applied again rather than skipped.
  fn roll_back(&mut self) {
    if let Err(e) = self.context.reload() {
      error!(error = %e, "Failed to reload checkpoint, refusing further deliveries");
      self.poisoned = true;
    }
  }

  fn apply(&mut self, message: &Message) -> Result<Vec<Emission>, RuntimeError> {
    let tenant = message.tenant_id;
    let reducer_error = |source| RuntimeError::Reducer { tenant, source };
    let (ledger, state) = self.context.split_tenant(tenant);
    let mut emitter = Emitter::new(ledger, tenant, &self.config.output_queues);

    match message.kind {
      MessageKind::Data => {
        self
          .reducer
          .on_data(state, message, &mut emitter)
          .map_err(reducer_error)?;
        Ok(emitter.into_emissions())
      }
      MessageKind::EndOfStream => {
        let decision = self
          .reducer
          .on_end_of_stream(state, message, &mut emitter)
          .map_err(reducer_error)?;
        match decision {
          EndOfStream::Forward => {
            emitter.broadcast(MessageKind::EndOfStream);
            let emissions = emitter.into_emissions();
            self.context.reset_tenant(tenant);
            info!(
              tenant,
              origin = %message.origin,
              emitted = emissions.len(),
              "Flushed tenant on end of stream"
            );
            Ok(emissions)
          }
          EndOfStream::Hold => {
            info!(
              tenant,
              origin = %message.origin,
              "Holding end of stream"
            );
            Ok(emitter.into_emissions())
          }
        }
      }
      MessageKind::Abort => {
        self.reducer.on_abort(state, message);
        emitter.broadcast(MessageKind::Abort);
        let emissions = emitter.into_emissions();
        self.context.discard_tenant(tenant);
        info!(tenant, origin = %message.origin, "Aborted tenant");
        Ok(emissions)
      }
      MessageKind::HealthProbe | MessageKind::Alive => Ok(Vec::new()),
    }
  }

  async fn handle_undecodable(
    &mut self,
    delivery: &Delivery,
    source: ProtocolError,
  ) -> Result<Outcome, RuntimeError> {
    match &self.config.decode_failure {
      DecodeFailurePolicy::Fail => Err(RuntimeError::Protocol {
        queue: delivery.queue.clone(),
        source,
      }),
      DecodeFailurePolicy::DeadLetter { queue } => {
        warn!(
          queue = %delivery.queue,
          dead_letter = %queue,
          error = %source,
          "Routing undecodable message to dead-letter queue"
        );
        let body = String::from_utf8_lossy(&delivery.body);
        self.broker.publish(queue, &body).await?;
        self.broker.ack(delivery.tag).await?;
        Ok(Outcome::DeadLettered)
      }
    }
  }
}
