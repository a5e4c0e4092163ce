use super::LivenessError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::info;

/// Restarts an unresponsive peer.
#[async_trait]
pub trait Reviver: Send + Sync {
  /// Attempts to bring `peer` back.
  async fn revive(&self, peer: &str) -> Result<(), LivenessError>;
}

/// Revives peers by running a program with the peer name as last argument.
///
/// The default runs `docker start <peer>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandReviver {
  program: String,
  args: Vec<String>,
}

impl Default for CommandReviver {
  fn default() -> Self {
    Self::new("docker", vec!["start".to_string()])
  }
}

impl CommandReviver {
  /// Creates a reviver running `program args... <peer>`.
  pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
    Self {
      program: program.into(),
      args,
    }
  }

  /// Parses a whitespace-separated command line. Returns `None` when it is
  /// blank.
  pub fn from_command_line(line: &str) -> Option<Self> {
    let mut parts = line.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some(Self::new(program, parts.collect()))
  }

  /// Program that is run.
  pub fn program(&self) -> &str {
    &self.program
  }

  /// Arguments placed before the peer name.
  pub fn args(&self) -> &[String] {
    &self.args
  }
}

#[async_trait]
impl Reviver for CommandReviver {
  async fn revive(&self, peer: &str) -> Result<(), LivenessError> {
    let status = Command::new(&self.program)
      .args(&self.args)
      .arg(peer)
      .kill_on_drop(true)
      .status()
      .await
      .map_err(|e| LivenessError::Revive {
        peer: peer.to_string(),
        reason: format!("failed to run {}: {}", self.program, e),
      })?;

    if !status.success() {
      return Err(LivenessError::Revive {
        peer: peer.to_string(),
        reason: format!("{} exited with {}", self.program, status),
      });
    }
    info!(peer = %peer, "Peer has been restarted");
    Ok(())
  }
}

/// Reviver that only records which peers it was asked to revive.
#[derive(Clone, Debug, Default)]
pub struct RecordingReviver {
  revived: Arc<Mutex<Vec<String>>>,
}

impl RecordingReviver {
  /// Creates an empty recorder.
  pub fn new() -> Self {
    Self::default()
  }

  /// Peers revived so far, in call order.
  pub fn revived(&self) -> Vec<String> {
    self
      .revived
      .lock()
      .map(|peers| peers.clone())
      .unwrap_or_default()
  }
}

#[async_trait]
impl Reviver for RecordingReviver {
  async fn revive(&self, peer: &str) -> Result<(), LivenessError> {
    let mut revived = self.revived.lock().map_err(|e| LivenessError::Revive {
      peer: peer.to_string(),
      reason: e.to_string(),
    })?;
    revived.push(peer.to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn command_line_is_split_on_whitespace() {
    let reviver = CommandReviver::from_command_line("  docker   start ").unwrap();
    assert_eq!(reviver, CommandReviver::default());
    assert!(CommandReviver::from_command_line("   ").is_none());
  }

  #[tokio::test]
  async fn successful_command_revives() {
    let reviver = CommandReviver::new("true", Vec::new());
    reviver.revive("sorter").await.unwrap();
  }

  #[tokio::test]
  async fn failing_command_is_reported() {
    let reviver = CommandReviver::new("false", Vec::new());
    let err = reviver.revive("sorter").await.unwrap_err();
    assert!(matches!(err, LivenessError::Revive { ref peer, .. } if peer == "sorter"));
  }

  #[tokio::test]
  async fn missing_program_is_reported() {
    let reviver = CommandReviver::new("/nonexistent/stageweave-revive", Vec::new());
    assert!(reviver.revive("sorter").await.is_err());
  }

  #[tokio::test]
  async fn recording_reviver_keeps_order() {
    let reviver = RecordingReviver::new();
    reviver.revive("a").await.unwrap();
    reviver.revive("b").await.unwrap();
    assert_eq!(reviver.revived(), vec!["a", "b"]);
  }
}
