//! # Error Handling
//!
//! Each module reports its own `thiserror` enum:
//!
//! - [`ProtocolError`](crate::protocol::ProtocolError): decoding and framing
//! - [`ConnectionError`](crate::transport::ConnectionError): peer sockets
//! - [`CheckpointError`](crate::checkpoint::CheckpointError): persistence
//! - [`BrokerError`](crate::broker::BrokerError): the broker boundary
//! - [`ReducerError`](crate::runtime::ReducerError): operator logic
//! - [`RuntimeError`](crate::runtime::RuntimeError): the data path
//! - [`LivenessError`](crate::liveness::LivenessError): health checks
//! - [`ConfigError`](crate::config::ConfigError) and
//!   [`LoggingError`](crate::observability::LoggingError): startup
//!
//! [`StageError`] unifies them for the stage lifecycle and the binaries.
//! Duplicates, ABORT and unhealthy peers are not errors: they are handled
//! and logged where they occur.

use crate::broker::BrokerError;
use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::liveness::LivenessError;
use crate::observability::LoggingError;
use crate::runtime::RuntimeError;
use thiserror::Error;

/// Any error that ends a stage process.
#[derive(Debug, Error)]
pub enum StageError {
  /// Invalid or missing configuration.
  #[error(transparent)]
  Config(#[from] ConfigError),
  /// Logging could not be set up.
  #[error(transparent)]
  Logging(#[from] LoggingError),
  /// The checkpoint could not be recovered.
  #[error(transparent)]
  Checkpoint(#[from] CheckpointError),
  /// The broker could not be set up.
  #[error(transparent)]
  Broker(#[from] BrokerError),
  /// The data path stopped on an error.
  #[error(transparent)]
  Runtime(#[from] RuntimeError),
  /// The liveness monitor could not start.
  #[error(transparent)]
  Liveness(#[from] LivenessError),
  /// A stage task panicked or was aborted.
  #[error("stage task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

/// Result alias for stage-level operations.
pub type StageResult<T> = Result<T, StageError>;

impl StageError {
  /// True when a restart from the last checkpoint can make progress, i.e.
  /// the failure happened while processing rather than at startup.
  pub fn is_restartable(&self) -> bool {
    matches!(
      self,
      StageError::Runtime(RuntimeError::Broker(_) | RuntimeError::Checkpoint(_) | RuntimeError::Poisoned)
        | StageError::Broker(_)
        | StageError::Task(_)
    )
  }
}
