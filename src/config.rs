//! # Stage Configuration
//!
//! [`StageConfig`] gathers everything one stage process needs: its name,
//! queue wiring, checkpoint location, batching, and health-check settings.
//! It is usually read from environment variables:
//!
//! | Variable                | Meaning                                      | Default        |
//! |-------------------------|----------------------------------------------|----------------|
//! | `CONTROLLER_NAME`       | stage name (required)                        |                |
//! | `LOGGING_LEVEL`         | log level                                    | `info`         |
//! | `CHECKPOINT_DIR`        | directory of `<name>_state.json`             | `.`            |
//! | `INPUT_QUEUE`           | consumed queue                               | none           |
//! | `OUTPUT_EXCHANGE`       | exchange bound to the output queues          | none           |
//! | `OUTPUT_QUEUES`         | comma-separated output queues                | none           |
//! | `BATCH_SIZE`            | rows per emitted message                     | `100`          |
//! | `HEALTH_CHECK_PORT`     | health responder port                        | `5000`         |
//! | `HEALTH_CHECK_INTERVAL` | seconds between probes of one peer           | `5`            |
//! | `HEALTH_CHECK_TIMEOUT`  | seconds allowed per probe                    | `3`            |
//! | `ROSTER_PATH`           | file listing the peers to monitor            | none           |
//! | `REVIVE_COMMAND`        | program and arguments; peer name is appended | `docker start` |
//! | `DEAD_LETTER_QUEUE`     | enables dead-letter routing of bad messages  | none           |
//!
//! The same settings can be loaded from a JSON file whose keys are the
//! lower-case field names of [`StageConfig`].

use crate::liveness::{CommandReviver, DEFAULT_HEALTH_CHECK_PORT, LivenessConfig};
use crate::reducers::GroupingConfig;
use crate::runtime::{DecodeFailurePolicy, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  /// A required variable is not set.
  #[error("missing required variable {0}")]
  Missing(&'static str),
  /// A variable is set to an unusable value.
  #[error("invalid value {value:?} for {variable}: {reason}")]
  Invalid {
    /// Variable or field name.
    variable: &'static str,
    /// Raw value.
    value: String,
    /// Why it was rejected.
    reason: String,
  },
  /// The config file could not be read.
  #[error("failed to read config file {path:?}: {source}")]
  Io {
    /// Config file path.
    path: PathBuf,
    /// Read error.
    #[source]
    source: std::io::Error,
  },
  /// The config file is not valid JSON for [`StageConfig`].
  #[error("invalid config file: {0}")]
  Json(#[from] serde_json::Error),
}

/// Settings of one stage process.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct StageConfig {
  /// Stable stage name; origin of everything the stage emits.
  pub controller_name: String,
  /// Log level used when `RUST_LOG` is not set.
  pub logging_level: String,
  /// Directory holding the stage checkpoint.
  pub checkpoint_dir: PathBuf,
  /// Consumed queue.
  pub input_queue: Option<String>,
  /// Exchange the output queues are bound to.
  pub output_exchange: Option<String>,
  /// Output queues (also routing keys), in partition order.
  pub output_queues: Vec<String>,
  /// Rows per emitted DATA message.
  pub batch_size: usize,
  /// Health responder port.
  pub health_check_port: u16,
  /// Seconds between two probes of one peer.
  pub health_check_interval: u64,
  /// Seconds allowed for one probe.
  pub health_check_timeout: u64,
  /// File listing the peers to monitor.
  pub roster_path: Option<PathBuf>,
  /// Revival program and leading arguments.
  pub revive_command: Vec<String>,
  /// Dead-letter queue for undecodable messages.
  pub dead_letter_queue: Option<String>,
}

impl Default for StageConfig {
  fn default() -> Self {
    Self {
      controller_name: String::new(),
      logging_level: "info".to_string(),
      checkpoint_dir: PathBuf::from("."),
      input_queue: None,
      output_exchange: None,
      output_queues: Vec::new(),
      batch_size: 100,
      health_check_port: DEFAULT_HEALTH_CHECK_PORT,
      health_check_interval: 5,
      health_check_timeout: 3,
      roster_path: None,
      revive_command: vec!["docker".to_string(), "start".to_string()],
      dead_letter_queue: None,
    }
  }
}

impl StageConfig {
  /// Creates a config for `controller_name` with defaults everywhere else.
  pub fn new(controller_name: impl Into<String>) -> Self {
    Self {
      controller_name: controller_name.into(),
      ..Self::default()
    }
  }

  /// Reads the config from the process environment.
  ///
  /// # Errors
  ///
  /// See [`StageConfig::from_lookup`].
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Reads the config through `lookup`, which maps a variable name to its
  /// value. Unset and blank variables keep their defaults.
  ///
  /// # Errors
  ///
  /// [`ConfigError::Missing`] without `CONTROLLER_NAME`,
  /// [`ConfigError::Invalid`] for values that do not parse or validate.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let mut config = Self::new(get("CONTROLLER_NAME").ok_or(ConfigError::Missing("CONTROLLER_NAME"))?);

    if let Some(level) = get("LOGGING_LEVEL") {
      config.logging_level = level;
    }
    if let Some(dir) = get("CHECKPOINT_DIR") {
      config.checkpoint_dir = PathBuf::from(dir);
    }
    config.input_queue = get("INPUT_QUEUE");
    config.output_exchange = get("OUTPUT_EXCHANGE");
    if let Some(queues) = get("OUTPUT_QUEUES") {
      config.output_queues = queues
        .split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect();
    }
    if let Some(value) = get("BATCH_SIZE") {
      config.batch_size = parse("BATCH_SIZE", &value)?;
    }
    if let Some(value) = get("HEALTH_CHECK_PORT") {
      config.health_check_port = parse("HEALTH_CHECK_PORT", &value)?;
    }
    if let Some(value) = get("HEALTH_CHECK_INTERVAL") {
      config.health_check_interval = parse("HEALTH_CHECK_INTERVAL", &value)?;
    }
    if let Some(value) = get("HEALTH_CHECK_TIMEOUT") {
      config.health_check_timeout = parse("HEALTH_CHECK_TIMEOUT", &value)?;
    }
    config.roster_path = get("ROSTER_PATH").map(PathBuf::from);
    if let Some(command) = get("REVIVE_COMMAND") {
      config.revive_command = command.split_whitespace().map(str::to_string).collect();
    }
    config.dead_letter_queue = get("DEAD_LETTER_QUEUE");

    config.validate()?;
    Ok(config)
  }

  /// Reads the config from a JSON file.
  ///
  /// # Errors
  ///
  /// [`ConfigError::Io`] when the file cannot be read, [`ConfigError::Json`]
  /// when it does not parse, and any validation error.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Self = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }

  /// Checks the values that have no usable fallback.
  ///
  /// # Errors
  ///
  /// [`ConfigError::Missing`] or [`ConfigError::Invalid`] naming the field.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.controller_name.trim().is_empty() {
      return Err(ConfigError::Missing("CONTROLLER_NAME"));
    }
    if self.batch_size == 0 {
      return Err(invalid("BATCH_SIZE", "0", "must be at least 1"));
    }
    if self.health_check_interval == 0 {
      return Err(invalid("HEALTH_CHECK_INTERVAL", "0", "must be at least 1"));
    }
    if self.health_check_timeout == 0 {
      return Err(invalid("HEALTH_CHECK_TIMEOUT", "0", "must be at least 1"));
    }
    if self.revive_command.is_empty() {
      return Err(invalid("REVIVE_COMMAND", "", "must name a program"));
    }
    Ok(())
  }

  /// Sets the checkpoint directory.
  #[must_use]
  pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.checkpoint_dir = dir.into();
    self
  }

  /// Sets the input queue.
  #[must_use]
  pub fn with_input_queue(mut self, queue: impl Into<String>) -> Self {
    self.input_queue = Some(queue.into());
    self
  }

  /// Sets the output exchange and queues.
  #[must_use]
  pub fn with_outputs(mut self, exchange: impl Into<String>, queues: Vec<String>) -> Self {
    self.output_exchange = Some(exchange.into());
    self.output_queues = queues;
    self
  }

  /// Sets the rows per emitted message.
  #[must_use]
  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  /// Sets the health-check port.
  #[must_use]
  pub fn with_health_check_port(mut self, port: u16) -> Self {
    self.health_check_port = port;
    self
  }

  /// Sets the roster file.
  #[must_use]
  pub fn with_roster_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.roster_path = Some(path.into());
    self
  }

  /// Enables dead-letter routing to `queue`.
  #[must_use]
  pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
    self.dead_letter_queue = Some(queue.into());
    self
  }

  /// Probe interval.
  pub fn health_check_interval(&self) -> Duration {
    Duration::from_secs(self.health_check_interval)
  }

  /// Probe timeout.
  pub fn health_check_timeout(&self) -> Duration {
    Duration::from_secs(self.health_check_timeout)
  }

  /// Decode failure handling implied by `dead_letter_queue`.
  pub fn decode_failure_policy(&self) -> DecodeFailurePolicy {
    match &self.dead_letter_queue {
      Some(queue) => DecodeFailurePolicy::DeadLetter {
        queue: queue.clone(),
      },
      None => DecodeFailurePolicy::Fail,
    }
  }

  /// Queue wiring for the operator runtime.
  ///
  /// # Errors
  ///
  /// [`ConfigError::Missing`] without an input queue.
  pub fn runtime_config(&self) -> Result<RuntimeConfig, ConfigError> {
    let input = self
      .input_queue
      .clone()
      .ok_or(ConfigError::Missing("INPUT_QUEUE"))?;
    let exchange = self
      .output_exchange
      .clone()
      .unwrap_or_else(|| format!("{}_exchange", self.controller_name));
    Ok(
      RuntimeConfig::new(input)
        .with_outputs(exchange, self.output_queues.clone())
        .with_decode_failure(self.decode_failure_policy()),
    )
  }

  /// Settings of the liveness monitor.
  pub fn liveness_config(&self) -> LivenessConfig {
    LivenessConfig::new(self.controller_name.clone())
      .with_port(self.health_check_port)
      .with_interval(self.health_check_interval())
      .with_timeout(self.health_check_timeout())
  }

  /// Grouping settings with this stage's `batch_size`.
  pub fn grouping_config(&self) -> GroupingConfig {
    GroupingConfig::default().with_batch_size(self.batch_size)
  }

  /// Reviver running `revive_command`.
  pub fn reviver(&self) -> CommandReviver {
    match self.revive_command.split_first() {
      Some((program, args)) => CommandReviver::new(program.clone(), args.to_vec()),
      None => CommandReviver::default(),
    }
  }
}

fn parse<T>(variable: &'static str, value: &str) -> Result<T, ConfigError>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  value
    .parse()
    .map_err(|e: T::Err| invalid(variable, value, &e.to_string()))
}

fn invalid(variable: &'static str, value: &str, reason: &str) -> ConfigError {
  ConfigError::Invalid {
    variable,
    value: value.to_string(),
    reason: reason.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;
  use tempfile::TempDir;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| vars.get(key).cloned()
  }

  #[test]
  fn reads_every_variable() {
    let config = StageConfig::from_lookup(lookup(&[
      ("CONTROLLER_NAME", "author_expander"),
      ("LOGGING_LEVEL", "DEBUG"),
      ("CHECKPOINT_DIR", "/state"),
      ("INPUT_QUEUE", "books"),
      ("OUTPUT_EXCHANGE", "authors"),
      ("OUTPUT_QUEUES", "authors_0, authors_1,"),
      ("BATCH_SIZE", "50"),
      ("HEALTH_CHECK_PORT", "5001"),
      ("HEALTH_CHECK_INTERVAL", "10"),
      ("HEALTH_CHECK_TIMEOUT", "2"),
      ("ROSTER_PATH", "/monitorable_controllers.txt"),
      ("REVIVE_COMMAND", "podman start"),
      ("DEAD_LETTER_QUEUE", "books_dlq"),
    ]))
    .unwrap();

    assert_eq!(config.controller_name, "author_expander");
    assert_eq!(config.logging_level, "DEBUG");
    assert_eq!(config.checkpoint_dir, PathBuf::from("/state"));
    assert_eq!(config.output_queues, vec!["authors_0", "authors_1"]);
    assert_eq!(config.batch_size, 50);
    assert_eq!(config.health_check_interval(), Duration::from_secs(10));
    assert_eq!(config.reviver(), CommandReviver::new("podman", vec!["start".to_string()]));
    assert_eq!(
      config.decode_failure_policy(),
      DecodeFailurePolicy::DeadLetter {
        queue: "books_dlq".to_string()
      }
    );

    let runtime = config.runtime_config().unwrap();
    assert_eq!(runtime.input_queue, "books");
    assert_eq!(runtime.output_exchange, "authors");

    let liveness = config.liveness_config();
    assert_eq!(liveness.port, 5001);
    assert_eq!(liveness.timeout, Duration::from_secs(2));
  }

  #[test]
  fn defaults_apply_when_unset() {
    let config = StageConfig::from_lookup(lookup(&[("CONTROLLER_NAME", "sorter")])).unwrap();
    assert_eq!(config.logging_level, "info");
    assert_eq!(config.health_check_port, 5000);
    assert_eq!(config.reviver(), CommandReviver::default());
    assert_eq!(config.decode_failure_policy(), DecodeFailurePolicy::Fail);
    assert!(matches!(
      config.runtime_config(),
      Err(ConfigError::Missing("INPUT_QUEUE"))
    ));
  }

  #[test]
  fn missing_name_is_an_error() {
    let err = StageConfig::from_lookup(lookup(&[("CONTROLLER_NAME", "  ")])).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("CONTROLLER_NAME")));
  }

  #[test]
  fn invalid_number_names_the_variable() {
    let err = StageConfig::from_lookup(lookup(&[
      ("CONTROLLER_NAME", "sorter"),
      ("HEALTH_CHECK_PORT", "70000"),
    ]))
    .unwrap_err();
    assert!(matches!(
      err,
      ConfigError::Invalid {
        variable: "HEALTH_CHECK_PORT",
        ..
      }
    ));

    let err = StageConfig::from_lookup(lookup(&[
      ("CONTROLLER_NAME", "sorter"),
      ("BATCH_SIZE", "0"),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { variable: "BATCH_SIZE", .. }));
  }

  #[test]
  fn loads_json_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stage.json");
    std::fs::write(
      &path,
      r#"{ "controller_name": "grouper", "input_queue": "reviews", "batch_size": 10 }"#,
    )
    .unwrap();
    let config = StageConfig::from_json_file(&path).unwrap();
    assert_eq!(config.controller_name, "grouper");
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.grouping_config().batch_size, 10);
    assert_eq!(config.health_check_timeout, 3);

    std::fs::write(&path, "{ nope").unwrap();
    assert!(matches!(
      StageConfig::from_json_file(&path),
      Err(ConfigError::Json(_))
    ));
  }
}
