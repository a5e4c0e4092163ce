//! # Stage Lifecycle
//!
//! A [`Stage`] wires one stage process together: it recovers the checkpoint,
//! binds the outputs, starts the health responder (and pollers when a roster
//! is given), runs the data path until it ends or the shared
//! `CancellationToken` fires, then closes the broker connection and stops
//! the liveness tasks.
//!
//! ```rust,no_run
//! use stageweave::broker::InMemoryBroker;
//! use stageweave::config::StageConfig;
//! use stageweave::reducers::TopKRanker;
//! use stageweave::stage::{Stage, cancel_on_signal};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> stageweave::error::StageResult<()> {
//! let config = StageConfig::from_env()?;
//! let stage = Stage::new(config, TopKRanker::new(10), InMemoryBroker::new());
//! let cancel = CancellationToken::new();
//! cancel_on_signal(cancel.clone());
//! stage.run(cancel).await
//! # }
//! ```

use crate::broker::Broker;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::StageConfig;
use crate::context::StageContext;
use crate::error::StageResult;
use crate::liveness::{LivenessMonitor, Reviver, Roster};
use crate::runtime::{OperatorRuntime, Reducer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

/// One stage process: data path plus liveness.
pub struct Stage<R: Reducer, B: Broker> {
  config: StageConfig,
  reducer: R,
  broker: B,
  store: Option<Arc<dyn CheckpointStore>>,
  roster: Roster,
  reviver: Option<Arc<dyn Reviver>>,
}

impl<R: Reducer, B: Broker> Stage<R, B> {
  /// Creates a stage that checkpoints under `config.checkpoint_dir` and
  /// monitors no peers.
  pub fn new(config: StageConfig, reducer: R, broker: B) -> Self {
    Self {
      config,
      reducer,
      broker,
      store: None,
      roster: Roster::default(),
      reviver: None,
    }
  }

  /// Uses `store` instead of the checkpoint file.
  #[must_use]
  pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Also polls the peers of `roster`, reviving them with `reviver`.
  #[must_use]
  pub fn with_liveness(mut self, roster: Roster, reviver: Arc<dyn Reviver>) -> Self {
    self.roster = roster;
    self.reviver = Some(reviver);
    self
  }

  /// Configuration of the stage.
  pub fn config(&self) -> &StageConfig {
    &self.config
  }

  /// Runs the stage until the input closes, the data path fails, or
  /// `cancel` fires.
  ///
  /// # Errors
  ///
  /// Startup failures (configuration, checkpoint recovery, binding) and the
  /// error that stopped the data path.
  pub async fn run(self, cancel: CancellationToken) -> StageResult<()> {
    let span = crate::observability::stage_span(&self.config.controller_name);
    self.run_inner(cancel).instrument(span).await
  }

  async fn run_inner(self, cancel: CancellationToken) -> StageResult<()> {
    let name = self.config.controller_name.clone();
    let runtime_config = self.config.runtime_config()?;
    let store = match self.store {
      Some(store) => store,
      None => Arc::new(FileCheckpointStore::for_stage(
        &self.config.checkpoint_dir,
        &name,
      )),
    };

    let context = StageContext::recover(name.clone(), store)?;
    let mut runtime = OperatorRuntime::new(self.reducer, self.broker, context, runtime_config);
    runtime.setup().await?;

    let reviver: Arc<dyn Reviver> = match self.reviver {
      Some(reviver) => reviver,
      None => Arc::new(self.config.reviver()),
    };
    let monitor = LivenessMonitor::new(self.config.liveness_config(), self.roster, reviver);
    let liveness_cancel = cancel.child_token();
    let mut liveness = monitor.spawn(liveness_cancel.clone()).await?;

    info!(stage = %name, "Stage started");
    let result = runtime.run(cancel).await;
    if let Err(e) = runtime.broker().close().await {
      warn!(error = %e, "Failed to close broker connection");
    }

    liveness_cancel.cancel();
    while let Some(joined) = liveness.join_next().await {
      if let Err(e) = joined {
        warn!(error = %e, "Liveness task ended abnormally");
      }
    }

    match &result {
      Ok(()) => info!(stage = %name, "Stage stopped"),
      Err(e) => error!(stage = %name, error = %e, "Stage failed"),
    }
    result.map_err(Into::into)
  }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!(error = %e, "Failed to listen for Ctrl-C");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
      Ok(mut sigterm) => {
        sigterm.recv().await;
      }
      Err(e) => {
        warn!(error = %e, "Failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
}

/// Cancels `token` when a shutdown signal arrives.
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    tokio::select! {
      _ = shutdown_signal() => {
        info!("Shutdown signal received");
        token.cancel();
      }
      _ = token.cancelled() => {}
    }
  })
}
