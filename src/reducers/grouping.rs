use super::literal::render_list;
use super::rows::{column, into_batches, parse_rows};
use crate::protocol::Message;
use crate::runtime::{Emitter, EndOfStream, Reducer, ReducerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Column layout and batching of a [`GroupingAggregator`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupingConfig {
  /// Column holding the grouping key.
  pub key_column: usize,
  /// Column whose value is collected for every row.
  pub value_column: usize,
  /// Columns copied from the first row seen for a key.
  pub carried_columns: Vec<usize>,
  /// Output rows per DATA message.
  pub batch_size: usize,
}

impl Default for GroupingConfig {
  fn default() -> Self {
    Self {
      key_column: 0,
      value_column: 1,
      carried_columns: Vec::new(),
      batch_size: 100,
    }
  }
}

impl GroupingConfig {
  /// Sets the key and value columns.
  #[must_use]
  pub fn with_columns(mut self, key_column: usize, value_column: usize) -> Self {
    self.key_column = key_column;
    self.value_column = value_column;
    self
  }

  /// Sets the carried columns, in output order.
  #[must_use]
  pub fn with_carried_columns(mut self, columns: Vec<usize>) -> Self {
    self.carried_columns = columns;
    self
  }

  /// Sets the number of output rows per DATA message.
  #[must_use]
  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }
}

/// One key's accumulated rows.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Group {
  /// Carried columns of the first row seen for the key.
  pub carried: Vec<String>,
  /// Value column of every row, in arrival order.
  pub values: Vec<String>,
}

/// Per-tenant state of a [`GroupingAggregator`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GroupingState {
  /// Groups by key.
  #[serde(default)]
  pub groups: BTreeMap<String, Group>,
}

/// Groups rows by a key column and emits one summary row per key at end of
/// stream: `key, carried..., [values], count`.
#[derive(Clone, Debug, Default)]
pub struct GroupingAggregator {
  config: GroupingConfig,
}

impl GroupingAggregator {
  /// Creates an aggregator with the given layout.
  pub fn new(config: GroupingConfig) -> Self {
    Self { config }
  }
}

impl Reducer for GroupingAggregator {
  type State = GroupingState;

  fn on_data(
    &mut self,
    state: &mut GroupingState,
    message: &Message,
    _emit: &mut Emitter<'_>,
  ) -> Result<(), ReducerError> {
    for row in parse_rows(&message.payload)? {
      let key = column(&row, self.config.key_column)?;
      let value = column(&row, self.config.value_column)?.to_string();
      if !state.groups.contains_key(key) {
        let carried = self
          .config
          .carried_columns
          .iter()
          .map(|&index| column(&row, index).map(str::to_string))
          .collect::<Result<Vec<_>, _>>()?;
        state.groups.insert(
          key.to_string(),
          Group {
            carried,
            values: Vec::new(),
          },
        );
      }
      if let Some(group) = state.groups.get_mut(key) {
        group.values.push(value);
      }
    }
    Ok(())
  }

  fn on_end_of_stream(
    &mut self,
    state: &mut GroupingState,
    message: &Message,
    emit: &mut Emitter<'_>,
  ) -> Result<EndOfStream, ReducerError> {
    let mut rows = Vec::with_capacity(state.groups.len());
    for (key, group) in &state.groups {
      let mut row = Vec::with_capacity(group.carried.len() + 3);
      row.push(key.clone());
      row.extend(group.carried.iter().cloned());
      row.push(render_list(&group.values)?);
      row.push(group.values.len().to_string());
      rows.push(row);
    }

    let batches = into_batches(rows, self.config.batch_size)?;
    debug!(
      tenant = message.tenant_id,
      groups = state.groups.len(),
      batches = batches.len(),
      "Flushing groups"
    );
    for batch in batches {
      emit.data(batch);
    }
    Ok(EndOfStream::Forward)
  }
}
