use super::ReducerError;
use crate::ledger::Ledger;
use crate::protocol::{Message, MessageKind, TenantId};

/// A message staged for publishing, with the queues it goes to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Emission {
  /// Target queues (routing keys), in publish order.
  pub queues: Vec<String>,
  /// The message, already numbered.
  pub message: Message,
}

/// Stages a reducer's outgoing messages for one tenant.
///
/// Each staged message takes the tenant's next outgoing sequence number and
/// commits it to the in-memory ledger right away. Nothing is published until
/// the runtime drains the emitter.
pub struct Emitter<'a> {
  ledger: &'a mut Ledger,
  tenant: TenantId,
  outputs: &'a [String],
  staged: Vec<Emission>,
}

impl<'a> Emitter<'a> {
  /// Creates an emitter for `tenant` publishing to `outputs`.
  pub fn new(ledger: &'a mut Ledger, tenant: TenantId, outputs: &'a [String]) -> Self {
    Self {
      ledger,
      tenant,
      outputs,
      staged: Vec::new(),
    }
  }

  /// Tenant this emitter numbers messages for.
  pub fn tenant(&self) -> TenantId {
    self.tenant
  }

  /// Output queues of the stage.
  pub fn outputs(&self) -> &[String] {
    self.outputs
  }

  /// Stages one DATA message for every output queue. Does nothing on a stage
  /// without outputs.
  pub fn data(&mut self, payload: impl Into<String>) {
    if self.outputs.is_empty() {
      return;
    }
    let queues = self.outputs.to_vec();
    self.stage(MessageKind::Data, queues, payload.into());
  }

  /// Stages one DATA message for output `partition` only.
  ///
  /// # Errors
  ///
  /// [`ReducerError::NoOutput`] when the stage has no output queues.
  pub fn data_to(&mut self, partition: usize, payload: impl Into<String>) -> Result<(), ReducerError> {
    if self.outputs.is_empty() {
      return Err(ReducerError::NoOutput);
    }
    let queue = self.outputs[partition % self.outputs.len()].clone();
    self.stage(MessageKind::Data, vec![queue], payload.into());
    Ok(())
  }

  /// Stages one empty-payload message of `kind` for every output queue.
  pub fn broadcast(&mut self, kind: MessageKind) {
    if self.outputs.is_empty() {
      return;
    }
    let queues = self.outputs.to_vec();
    self.stage(kind, queues, String::new());
  }

  /// Number of staged messages.
  pub fn len(&self) -> usize {
    self.staged.len()
  }

  /// True when nothing is staged.
  pub fn is_empty(&self) -> bool {
    self.staged.is_empty()
  }

  /// Consumes the emitter, returning staged messages in emission order.
  pub fn into_emissions(self) -> Vec<Emission> {
    self.staged
  }

  fn stage(&mut self, kind: MessageKind, queues: Vec<String>, payload: String) {
    let sequence = self.ledger.next_outgoing(self.tenant);
    self.ledger.commit_outgoing(self.tenant, sequence);
    let message = Message::new(
      kind,
      self.tenant,
      self.ledger.self_origin(),
      sequence,
      payload,
    );
    self.staged.push(Emission { queues, message });
  }
}
