//! Checkpoint document layout.
//!
//! ```json
//! {
//!   "7": {
//!     "latest_message_per_controller": { "counter": 12, "grouper": 3 },
//!     "groups": { ... }
//!   }
//! }
//! ```
//!
//! Top-level keys are tenant ids. Each tenant entry holds the ledger buffer
//! next to the reducer state's own named buffers, flattened into one object.

use super::CheckpointError;
use crate::ledger::{Ledger, OriginSequences};
use crate::protocol::TenantId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize)]
struct TenantEntryRef<'a, S> {
  #[serde(rename = "latest_message_per_controller")]
  ledger: &'a OriginSequences,
  #[serde(flatten)]
  state: &'a S,
}

#[derive(Deserialize)]
struct TenantEntry<S> {
  #[serde(rename = "latest_message_per_controller", default)]
  ledger: OriginSequences,
  #[serde(flatten)]
  state: S,
}

/// Serializes a ledger and the per-tenant state into one checkpoint document.
///
/// Tenants that only appear in one of the two maps still get an entry; a
/// missing state is written as `S::default()`.
pub fn encode<S>(ledger: &Ledger, states: &BTreeMap<TenantId, S>) -> Result<Vec<u8>, CheckpointError>
where
  S: Serialize + Default,
{
  let empty_ledger = OriginSequences::new();
  let empty_state = S::default();

  let mut tenants: Vec<TenantId> = ledger.tenants().chain(states.keys().copied()).collect();
  tenants.sort_unstable();
  tenants.dedup();

  let document: BTreeMap<String, TenantEntryRef<'_, S>> = tenants
    .into_iter()
    .map(|tenant| {
      let entry = TenantEntryRef {
        ledger: ledger.tenant(tenant).unwrap_or(&empty_ledger),
        state: states.get(&tenant).unwrap_or(&empty_state),
      };
      (tenant.to_string(), entry)
    })
    .collect();

  Ok(serde_json::to_vec_pretty(&document)?)
}

/// Parses a checkpoint document back into a ledger for `self_origin` and the
/// per-tenant state.
pub fn decode<S>(
  self_origin: &str,
  data: &[u8],
) -> Result<(Ledger, BTreeMap<TenantId, S>), CheckpointError>
where
  S: DeserializeOwned,
{
  let document: BTreeMap<String, TenantEntry<S>> = serde_json::from_slice(data)?;

  let mut entries = BTreeMap::new();
  let mut states = BTreeMap::new();
  for (key, entry) in document {
    let tenant: TenantId = key
      .parse()
      .map_err(|_| CheckpointError::InvalidTenant(key.clone()))?;
    if !entry.ledger.is_empty() {
      entries.insert(tenant, entry.ledger);
    }
    states.insert(tenant, entry.state);
  }

  Ok((Ledger::from_entries(self_origin, entries), states))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ledger::LEDGER_BUFFER;

  #[derive(Debug, Default, Deserialize, PartialEq, Serialize)]
  struct Counts {
    #[serde(default)]
    books_reviews: BTreeMap<String, u32>,
  }

  #[test]
  fn layout_keeps_ledger_next_to_state_buffers() {
    let mut ledger = Ledger::new("grouper");
    ledger.commit(7, "counter", 12);
    let mut states = BTreeMap::new();
    states.insert(
      7,
      Counts {
        books_reviews: BTreeMap::from([("Book A".to_string(), 2)]),
      },
    );

    let bytes = encode(&ledger, &states).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["7"][LEDGER_BUFFER]["counter"], 12);
    assert_eq!(value["7"]["books_reviews"]["Book A"], 2);
  }

  #[test]
  fn decode_restores_ledger_and_state() {
    let mut ledger = Ledger::new("grouper");
    ledger.commit(7, "counter", 12);
    ledger.commit_outgoing(7, 3);
    let mut states = BTreeMap::new();
    states.insert(9, Counts::default());

    let bytes = encode(&ledger, &states).unwrap();
    let (restored, restored_states) = decode::<Counts>("grouper", &bytes).unwrap();
    assert_eq!(restored, ledger);
    assert_eq!(restored_states.len(), 2);
    assert_eq!(restored_states[&9], Counts::default());
  }

  #[test]
  fn missing_ledger_buffer_defaults_to_empty() {
    let (ledger, states) = decode::<Counts>("grouper", br#"{"4": {"books_reviews": {}}}"#).unwrap();
    assert!(ledger.tenant(4).is_none());
    assert!(states.contains_key(&4));
  }

  #[test]
  fn non_numeric_tenant_is_rejected() {
    let err = decode::<Counts>("grouper", br#"{"abc": {}}"#).unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidTenant(ref k) if k == "abc"));
  }

  #[test]
  fn corrupt_document_is_an_error() {
    let err = decode::<Counts>("grouper", b"{ not json").unwrap_err();
    assert!(matches!(err, CheckpointError::Serialization(_)));
  }
}
