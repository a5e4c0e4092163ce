//! Per-stage ledger and operator state, persisted together.
//!
//! A [`StageContext`] is built once per stage instance, recovered from its
//! checkpoint store, and then owned by the data-path runtime. Nothing else
//! mutates it, so it needs no locking.

use crate::checkpoint::{CheckpointError, CheckpointStore, snapshot};
use crate::ledger::Ledger;
use crate::protocol::TenantId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// The dedup ledger plus the reducer state of every tenant.
pub struct StageContext<S> {
  ledger: Ledger,
  state: BTreeMap<TenantId, S>,
  store: Arc<dyn CheckpointStore>,
}

impl<S> StageContext<S>
where
  S: Default + Serialize + DeserializeOwned,
{
  /// Creates an empty context for `stage_name`. Nothing is read from `store`.
  pub fn new(stage_name: impl Into<String>, store: Arc<dyn CheckpointStore>) -> Self {
    Self {
      ledger: Ledger::new(stage_name),
      state: BTreeMap::new(),
      store,
    }
  }

  /// Loads the last checkpoint from `store`, or starts empty when there is
  /// none.
  ///
  /// # Errors
  ///
  /// A checkpoint that exists but cannot be read or parsed is an error; it is
  /// never discarded.
  pub fn recover(
    stage_name: impl Into<String>,
    store: Arc<dyn CheckpointStore>,
  ) -> Result<Self, CheckpointError> {
    let stage_name = stage_name.into();
    match store.load()? {
      Some(data) => {
        let (ledger, state) = snapshot::decode(&stage_name, &data)?;
        info!(
          stage = %stage_name,
          tenants = state.len(),
          "Recovered stage checkpoint"
        );
        Ok(Self {
          ledger,
          state,
          store,
        })
      }
      None => {
        info!(stage = %stage_name, "No checkpoint found, starting empty");
        Ok(Self::new(stage_name, store))
      }
    }
  }

  /// Replaces the in-memory ledger and state with the last checkpoint.
  ///
  /// # Errors
  ///
  /// Same as [`StageContext::recover`]. On error the context is unchanged.
  pub fn reload(&mut self) -> Result<(), CheckpointError> {
    let stage_name = self.ledger.self_origin().to_string();
    *self = Self::recover(stage_name, Arc::clone(&self.store))?;
    Ok(())
  }

  /// The dedup ledger.
  pub fn ledger(&self) -> &Ledger {
    &self.ledger
  }

  /// Mutable access to the dedup ledger.
  pub fn ledger_mut(&mut self) -> &mut Ledger {
    &mut self.ledger
  }

  /// Reducer state for `tenant`, if any.
  pub fn tenant_state(&self, tenant: TenantId) -> Option<&S> {
    self.state.get(&tenant)
  }

  /// Tenants that currently hold reducer state.
  pub fn tenants(&self) -> impl Iterator<Item = TenantId> + '_ {
    self.state.keys().copied()
  }

  /// Borrows the ledger and the tenant's state (created on first use) at the
  /// same time.
  pub fn split_tenant(&mut self, tenant: TenantId) -> (&mut Ledger, &mut S) {
    (&mut self.ledger, self.state.entry(tenant).or_default())
  }

  /// Drops all reducer state of `tenant`. Ledger entries are kept.
  pub fn discard_tenant(&mut self, tenant: TenantId) {
    self.state.remove(&tenant);
  }

  /// Resets the tenant's reducer state to its default.
  pub fn reset_tenant(&mut self, tenant: TenantId) {
    self.state.insert(tenant, S::default());
  }

  /// Encodes the full ledger and state as a checkpoint document.
  ///
  /// # Errors
  ///
  /// Fails if the state does not serialize.
  pub fn snapshot(&self) -> Result<Vec<u8>, CheckpointError> {
    snapshot::encode(&self.ledger, &self.state)
  }

  /// Atomically writes the full ledger and state to the store.
  ///
  /// # Errors
  ///
  /// Any serialization or storage failure.
  pub fn persist(&self) -> Result<(), CheckpointError> {
    let data = self.snapshot()?;
    self.store.save(&data)
  }
}
