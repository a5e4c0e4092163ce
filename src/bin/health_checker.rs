//! Health checker process.
//!
//! Answers probes on its own port and polls every stage listed in the roster
//! file, reviving the ones that do not answer. Configured through the same
//! environment variables as any stage (`CONTROLLER_NAME`, `LOGGING_LEVEL`,
//! `HEALTH_CHECK_*`, `ROSTER_PATH`, `REVIVE_COMMAND`).

use stageweave::config::StageConfig;
use stageweave::error::StageResult;
use stageweave::liveness::{LivenessMonitor, Roster};
use stageweave::observability::{init_logging, stage_span};
use stageweave::stage::cancel_on_signal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

const DEFAULT_ROSTER_PATH: &str = "/monitorable_controllers.txt";

#[tokio::main]
async fn main() {
  if let Err(e) = run().await {
    error!(error = %e, "Health checker failed");
    eprintln!("health-checker: {e}");
    std::process::exit(1);
  }
}

async fn run() -> StageResult<()> {
  let config = StageConfig::from_env()?;
  init_logging(&config.logging_level)?;

  let roster_path = config
    .roster_path
    .clone()
    .unwrap_or_else(|| PathBuf::from(DEFAULT_ROSTER_PATH));
  let roster = Roster::load(&roster_path, &config.controller_name).await?;
  info!(
    roster = %roster_path.display(),
    peers = roster.len(),
    "Loaded roster"
  );

  let monitor = LivenessMonitor::new(
    config.liveness_config(),
    roster,
    Arc::new(config.reviver()),
  );

  let cancel = CancellationToken::new();
  let signals = cancel_on_signal(cancel.clone());
  monitor
    .run(cancel.clone())
    .instrument(stage_span(&config.controller_name))
    .await?;
  cancel.cancel();
  signals.await?;
  Ok(())
}
