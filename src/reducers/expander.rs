use super::literal::parse_list;
use super::rows::{column, parse_rows, to_payload};
use crate::partitioning::{PartitionKey, partition_for};
use crate::protocol::Message;
use crate::runtime::{Emitter, EndOfStream, Reducer, ReducerError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Per-tenant state of a [`PartitioningExpander`]: producers that already
/// finished.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExpanderState {
  /// Origins that sent END_OF_STREAM.
  #[serde(default)]
  pub finished_producers: BTreeSet<String>,
}

/// Expands a list-valued column into one row per item and routes each row to
/// an output partition by the item's stable hash.
///
/// With rows `['Ann', 'Bob'],1990` the expander emits `Ann,1990` and
/// `Bob,1990`, each to the partition of its author. END_OF_STREAM is only
/// forwarded once every expected upstream producer has sent one.
#[derive(Clone, Debug)]
pub struct PartitioningExpander {
  list_column: usize,
  expected_producers: usize,
}

impl Default for PartitioningExpander {
  fn default() -> Self {
    Self::new(0, 1)
  }
}

impl PartitioningExpander {
  /// Creates an expander reading lists from `list_column` and waiting for
  /// `expected_producers` distinct END_OF_STREAM origins.
  pub fn new(list_column: usize, expected_producers: usize) -> Self {
    Self {
      list_column,
      expected_producers: expected_producers.max(1),
    }
  }
}

impl Reducer for PartitioningExpander {
  type State = ExpanderState;

  fn on_data(
    &mut self,
    _state: &mut ExpanderState,
    message: &Message,
    emit: &mut Emitter<'_>,
  ) -> Result<(), ReducerError> {
    let partitions = emit.outputs().len();
    let mut batches: BTreeMap<usize, Vec<Vec<String>>> = BTreeMap::new();

    for row in parse_rows(&message.payload)? {
      let items = parse_list(column(&row, self.list_column)?)?;
      let rest: Vec<String> = row
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != self.list_column)
        .map(|(_, field)| field.to_string())
        .collect();

      for item in items {
        let key = PartitionKey::from(item);
        let partition = partition_for(&key, partitions).ok_or(ReducerError::NoOutput)?;
        let mut expanded = Vec::with_capacity(rest.len() + 1);
        expanded.push(key.0);
        expanded.extend(rest.iter().cloned());
        batches.entry(partition).or_default().push(expanded);
      }
    }

    for (partition, rows) in batches {
      debug!(
        tenant = message.tenant_id,
        partition,
        rows = rows.len(),
        "Routing expanded rows"
      );
      emit.data_to(partition, to_payload(rows)?)?;
    }
    Ok(())
  }

  fn on_end_of_stream(
    &mut self,
    state: &mut ExpanderState,
    message: &Message,
    _emit: &mut Emitter<'_>,
  ) -> Result<EndOfStream, ReducerError> {
    state.finished_producers.insert(message.origin.clone());
    let finished = state.finished_producers.len();
    if finished >= self.expected_producers {
      Ok(EndOfStream::Forward)
    } else {
      info!(
        tenant = message.tenant_id,
        finished,
        expected = self.expected_producers,
        "Waiting for remaining producers"
      );
      Ok(EndOfStream::Hold)
    }
  }
}
