//! Logging setup for stage processes.
//!
//! Stages log through `tracing` with structured fields (`tenant`, `origin`,
//! `sequence`, `peer`). [`init_logging`] installs a `fmt` subscriber whose
//! filter comes from `RUST_LOG` when set, and from the configured level
//! otherwise.

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while setting up logging.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
  /// The configured level is not a known level name.
  #[error("unknown logging level {0:?}")]
  InvalidLevel(String),
}

/// Maps a configured level name to a `tracing` filter directive.
///
/// Accepts the usual names in any case, plus `WARNING` and `CRITICAL`.
///
/// # Errors
///
/// [`LoggingError::InvalidLevel`] for anything else.
pub fn normalize_level(level: &str) -> Result<&'static str, LoggingError> {
  match level.trim().to_ascii_lowercase().as_str() {
    "trace" => Ok("trace"),
    "debug" => Ok("debug"),
    "info" => Ok("info"),
    "warn" | "warning" => Ok("warn"),
    "error" | "critical" | "fatal" => Ok("error"),
    "off" => Ok("off"),
    _ => Err(LoggingError::InvalidLevel(level.to_string())),
  }
}

/// Installs the global subscriber.
///
/// Safe to call more than once: when a subscriber is already installed the
/// call does nothing.
///
/// # Errors
///
/// [`LoggingError::InvalidLevel`] when `level` is unknown.
pub fn init_logging(level: &str) -> Result<(), LoggingError> {
  let directive = normalize_level(level)?;
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

  let _ = tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_target(true))
    .try_init();
  Ok(())
}

/// Span wrapping everything a stage process does.
#[must_use]
pub fn stage_span(stage: &str) -> Span {
  tracing::info_span!("stage", stage = stage)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_levels_are_normalized() {
    assert_eq!(normalize_level("DEBUG").unwrap(), "debug");
    assert_eq!(normalize_level(" Warning ").unwrap(), "warn");
    assert_eq!(normalize_level("CRITICAL").unwrap(), "error");
    assert!(matches!(
      normalize_level("loud"),
      Err(LoggingError::InvalidLevel(_))
    ));
  }

  #[test]
  fn test_init_logging_is_idempotent() {
    init_logging("info").unwrap();
    init_logging("debug").unwrap();
    assert!(init_logging("nope").is_err());
  }

  #[test]
  fn test_stage_span_accepts_events() {
    let span = stage_span("sorter");
    let _guard = span.enter();
    tracing::info!("message in stage span");
  }
}
