use super::LivenessError;
use std::path::Path;

/// The peers a stage monitors, read once at startup.
///
/// The roster file holds one stage name per line. Blank lines and
/// surrounding whitespace are ignored, the stage itself is excluded, and
/// repeated names are collapsed to their first occurrence.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Roster {
  peers: Vec<String>,
}

impl Roster {
  /// Parses roster text, excluding `self_name`.
  pub fn parse(text: &str, self_name: &str) -> Self {
    let mut peers: Vec<String> = Vec::new();
    for name in text.lines().map(str::trim) {
      if name.is_empty() || name == self_name || peers.iter().any(|p| p == name) {
        continue;
      }
      peers.push(name.to_string());
    }
    Self { peers }
  }

  /// Reads and parses the roster file at `path`.
  ///
  /// # Errors
  ///
  /// [`LivenessError::Roster`] when the file cannot be read.
  pub async fn load(path: impl AsRef<Path>, self_name: &str) -> Result<Self, LivenessError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
      .await
      .map_err(|source| LivenessError::Roster {
        path: path.to_path_buf(),
        source,
      })?;
    Ok(Self::parse(&text, self_name))
  }

  /// Builds a roster from explicit names, excluding `self_name`.
  pub fn from_peers<I, S>(peers: I, self_name: &str) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let text: Vec<String> = peers.into_iter().map(|p| p.as_ref().to_string()).collect();
    Self::parse(&text.join("\n"), self_name)
  }

  /// Peer names in file order.
  pub fn peers(&self) -> &[String] {
    &self.peers
  }

  /// Number of peers.
  pub fn len(&self) -> usize {
    self.peers.len()
  }

  /// True when there is nobody to monitor.
  pub fn is_empty(&self) -> bool {
    self.peers.is_empty()
  }
}
