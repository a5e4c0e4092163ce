//! Per-tenant sequence-number deduplication ledger.
//!
//! The ledger maps `tenant → origin → last applied sequence`. It answers two
//! questions for the data path:
//!
//! - has this inbound `(tenant, origin, sequence)` already been applied?
//! - which sequence number does the next outbound message for a tenant get?
//!
//! The stage's own name is an ordinary origin key, so the same table numbers
//! both what the stage consumed and what it emitted. [`Ledger::next_outgoing`]
//! is a pure function of the table; replaying a message against an unchanged
//! ledger therefore yields the same outbound sequence numbers.

use crate::protocol::{SequenceNumber, TenantId};
use std::collections::BTreeMap;

/// Name of the ledger buffer inside each tenant entry of a checkpoint.
pub const LEDGER_BUFFER: &str = "latest_message_per_controller";

/// Last applied sequence per origin, for one tenant.
pub type OriginSequences = BTreeMap<String, SequenceNumber>;

/// Process-local dedup ledger for one stage instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Ledger {
  self_origin: String,
  entries: BTreeMap<TenantId, OriginSequences>,
}

impl Ledger {
  /// Creates an empty ledger for the stage named `self_origin`.
  pub fn new(self_origin: impl Into<String>) -> Self {
    Self {
      self_origin: self_origin.into(),
      entries: BTreeMap::new(),
    }
  }

  /// Rebuilds a ledger from recovered entries.
  pub fn from_entries(
    self_origin: impl Into<String>,
    entries: BTreeMap<TenantId, OriginSequences>,
  ) -> Self {
    Self {
      self_origin: self_origin.into(),
      entries,
    }
  }

  /// The stage's own origin name.
  pub fn self_origin(&self) -> &str {
    &self.self_origin
  }

  /// Last applied sequence for `(tenant, origin)`, `0` when never seen.
  pub fn last_applied(&self, tenant: TenantId, origin: &str) -> SequenceNumber {
    self
      .entries
      .get(&tenant)
      .and_then(|origins| origins.get(origin))
      .copied()
      .unwrap_or(0)
  }

  /// Sequence number for the next message this stage emits for `tenant`.
  ///
  /// Does not mutate the ledger: two calls without an intervening
  /// [`Ledger::commit_outgoing`] return the same value.
  pub fn next_outgoing(&self, tenant: TenantId) -> SequenceNumber {
    self.last_applied(tenant, &self.self_origin) + 1
  }

  /// True when `sequence` was already applied for `(tenant, origin)`.
  pub fn is_duplicate(&self, tenant: TenantId, origin: &str, sequence: SequenceNumber) -> bool {
    sequence <= self.last_applied(tenant, origin)
  }

  /// Records `sequence` as applied for `(tenant, origin)`.
  ///
  /// The recorded value never decreases; committing a stale sequence leaves
  /// the entry untouched.
  pub fn commit(&mut self, tenant: TenantId, origin: &str, sequence: SequenceNumber) {
    let origins = self.entries.entry(tenant).or_default();
    match origins.get_mut(origin) {
      Some(last) => *last = (*last).max(sequence),
      None => {
        origins.insert(origin.to_string(), sequence);
      }
    }
  }

  /// Records `sequence` as emitted by this stage for `tenant`.
  pub fn commit_outgoing(&mut self, tenant: TenantId, sequence: SequenceNumber) {
    let origin = self.self_origin.clone();
    self.commit(tenant, &origin, sequence);
  }

  /// Per-origin entries for `tenant`, if any message was seen for it.
  pub fn tenant(&self, tenant: TenantId) -> Option<&OriginSequences> {
    self.entries.get(&tenant)
  }

  /// Tenants with at least one entry, ascending.
  pub fn tenants(&self) -> impl Iterator<Item = TenantId> + '_ {
    self.entries.keys().copied()
  }

  /// Full table, for checkpointing.
  pub fn entries(&self) -> &BTreeMap<TenantId, OriginSequences> {
    &self.entries
  }
}
