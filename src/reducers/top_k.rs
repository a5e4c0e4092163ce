use super::literal::parse_list;
use super::rows::{column, join, parse_rows, to_payload};
use crate::protocol::Message;
use crate::runtime::{Emitter, EndOfStream, Reducer, ReducerError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Per-tenant state of a [`TopKRanker`]: at most K `(key, score)` pairs,
/// highest score first.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TopKState {
  /// Current ranking.
  #[serde(default)]
  pub ranking: Vec<(String, f64)>,
}

impl TopKState {
  /// Offers `(key, score)` to a ranking bounded at `k` entries.
  ///
  /// Below capacity the pair is always kept. At capacity it is kept only if
  /// it beats the current minimum strictly, which then gets evicted. Equal
  /// scores keep their arrival order.
  pub fn offer(&mut self, k: usize, key: String, score: f64) {
    if self.ranking.len() < k {
      self.ranking.push((key, score));
      self.sort();
      return;
    }
    match self.ranking.last() {
      Some((_, lowest)) if score > *lowest => {
        self.ranking.push((key, score));
        self.sort();
        self.ranking.pop();
      }
      _ => {}
    }
  }

  fn sort(&mut self) {
    self.ranking.sort_by(|a, b| b.1.total_cmp(&a.1));
  }
}

/// Keeps the K rows with the highest average score per tenant.
///
/// Input rows are `key, [scores]`. At end of stream the ranking is emitted as
/// one DATA message with one `key,score` row per entry.
#[derive(Clone, Debug)]
pub struct TopKRanker {
  k: usize,
  key_column: usize,
  scores_column: usize,
}

impl TopKRanker {
  /// Creates a ranker keeping `k` entries, reading keys from column 0 and
  /// score lists from column 1.
  pub fn new(k: usize) -> Self {
    Self {
      k,
      key_column: 0,
      scores_column: 1,
    }
  }

  /// Reads keys and score lists from other columns.
  #[must_use]
  pub fn with_columns(mut self, key_column: usize, scores_column: usize) -> Self {
    self.key_column = key_column;
    self.scores_column = scores_column;
    self
  }

  /// Capacity of the ranking.
  pub fn k(&self) -> usize {
    self.k
  }
}

impl Reducer for TopKRanker {
  type State = TopKState;

  fn on_data(
    &mut self,
    state: &mut TopKState,
    message: &Message,
    _emit: &mut Emitter<'_>,
  ) -> Result<(), ReducerError> {
    for row in parse_rows(&message.payload)? {
      let key = column(&row, self.key_column)?;
      let items = parse_list(column(&row, self.scores_column)?)?;
      if items.is_empty() {
        warn!(
          tenant = message.tenant_id,
          key = %key,
          "Skipping row with empty score list"
        );
        continue;
      }

      let mut sum = 0.0;
      for item in &items {
        sum += item.trim().parse::<f64>().map_err(|e| ReducerError::MalformedRow {
          row: join(&row),
          reason: format!("score {item:?}: {e}"),
        })?;
      }
      state.offer(self.k, key.to_string(), sum / items.len() as f64);
    }
    Ok(())
  }

  fn on_end_of_stream(
    &mut self,
    state: &mut TopKState,
    message: &Message,
    emit: &mut Emitter<'_>,
  ) -> Result<EndOfStream, ReducerError> {
    debug!(
      tenant = message.tenant_id,
      entries = state.ranking.len(),
      "Emitting ranking"
    );
    if !state.ranking.is_empty() {
      let rows = state
        .ranking
        .iter()
        .map(|(key, score)| vec![key.clone(), format!("{score:?}")]);
      emit.data(to_payload(rows)?);
    }
    Ok(EndOfStream::Forward)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn keys(state: &TopKState) -> Vec<&str> {
    state.ranking.iter().map(|(k, _)| k.as_str()).collect()
  }

  #[test]
  fn keeps_highest_scores_in_order() {
    let mut state = TopKState::default();
    state.offer(2, "A".into(), 10.0);
    state.offer(2, "B".into(), 1.0);
    state.offer(2, "C".into(), 5.0);
    assert_eq!(
      state.ranking,
      vec![("A".to_string(), 10.0), ("C".to_string(), 5.0)]
    );
  }

  #[test]
  fn ties_with_the_minimum_are_not_inserted() {
    let mut state = TopKState::default();
    state.offer(2, "A".into(), 3.0);
    state.offer(2, "B".into(), 2.0);
    state.offer(2, "C".into(), 2.0);
    assert_eq!(keys(&state), vec!["A", "B"]);
  }

  #[test]
  fn zero_capacity_keeps_nothing() {
    let mut state = TopKState::default();
    state.offer(0, "A".into(), 3.0);
    assert!(state.ranking.is_empty());
  }

  #[test]
  fn scores_are_averaged_from_list_literal() {
    let mut ranker = TopKRanker::new(3);
    let mut state = TopKState::default();
    let mut ledger = crate::ledger::Ledger::new("sorter");
    let mut emit = Emitter::new(&mut ledger, 1, &[]);
    ranker
      .on_data(
        &mut state,
        &Message::data(1, "counter", 1, "A,\"['4', '2']\"\nB,[]\nC,\"[1, 2, 3]\"\n"),
        &mut emit,
      )
      .unwrap();
    assert_eq!(
      state.ranking,
      vec![("A".to_string(), 3.0), ("C".to_string(), 2.0)]
    );
  }

  #[test]
  fn non_numeric_score_is_malformed() {
    let mut ranker = TopKRanker::new(3);
    let mut state = TopKState::default();
    let mut ledger = crate::ledger::Ledger::new("sorter");
    let mut emit = Emitter::new(&mut ledger, 1, &[]);
    let err = ranker
      .on_data(
        &mut state,
        &Message::data(1, "counter", 1, "A,\"['x']\""),
        &mut emit,
      )
      .unwrap_err();
    assert!(matches!(err, ReducerError::MalformedRow { .. }));
  }
}
