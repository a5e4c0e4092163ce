//! Pluggable operator logic.
//!
//! A [`Reducer`] folds one tenant's messages into a typed state value and
//! emits derived messages through an [`Emitter`]. It never sees duplicates,
//! never touches the ledger directly, and never does I/O: the runtime owns
//! decoding, deduplication, publishing, persistence and acknowledgment.

use super::Emitter;
use crate::protocol::Message;
use crate::reducers::literal::LiteralError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// What the runtime does after [`Reducer::on_end_of_stream`] returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndOfStream {
  /// The tenant is done: forward END_OF_STREAM on every output and reset the
  /// tenant's state.
  Forward,
  /// Keep the state and forward nothing yet (e.g. a barrier still waiting on
  /// other producers).
  Hold,
}

/// Errors raised by reducer logic. All of them stop the data path.
#[derive(Debug, Error)]
pub enum ReducerError {
  /// A payload row could not be used.
  #[error("malformed row {row:?}: {reason}")]
  MalformedRow {
    /// The offending row, joined back with commas.
    row: String,
    /// What was wrong with it.
    reason: String,
  },
  /// A row is shorter than the configured column index.
  #[error("row {row:?} has no column {index}")]
  MissingColumn {
    /// Zero-based column index.
    index: usize,
    /// The offending row, joined back with commas.
    row: String,
  },
  /// A list literal did not parse.
  #[error("list literal: {0}")]
  Literal(#[from] LiteralError),
  /// The payload is not valid CSV.
  #[error("csv: {0}")]
  Csv(#[from] csv::Error),
  /// Emitting was requested on a stage without output queues.
  #[error("stage has no output queues")]
  NoOutput,
}

/// Operator logic plugged into the runtime.
pub trait Reducer: Send {
  /// Per-tenant state. Its fields are the named buffers stored next to the
  /// ledger in the checkpoint.
  type State: Default + Serialize + DeserializeOwned + Send;

  /// Folds one DATA message into `state`.
  fn on_data(
    &mut self,
    state: &mut Self::State,
    message: &Message,
    emit: &mut Emitter<'_>,
  ) -> Result<(), ReducerError>;

  /// Flushes `state` when an END_OF_STREAM arrives.
  fn on_end_of_stream(
    &mut self,
    state: &mut Self::State,
    message: &Message,
    emit: &mut Emitter<'_>,
  ) -> Result<EndOfStream, ReducerError>;

  /// Runs before the tenant's state is discarded on ABORT.
  fn on_abort(&mut self, _state: &mut Self::State, _message: &Message) {}
}
