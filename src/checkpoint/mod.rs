//! Durable per-stage checkpoints.
//!
//! A checkpoint holds the whole dedup ledger and the whole operator state of
//! one stage instance as a single JSON document (see [`snapshot`] for the
//! layout). Storage backends only move bytes; they must replace the previous
//! checkpoint atomically so a reader sees either the old or the new snapshot,
//! never a mix.

pub mod snapshot;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Error type for checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] io::Error),
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  /// A tenant key in the checkpoint is not a tenant id.
  #[error("invalid tenant key in checkpoint: {0:?}")]
  InvalidTenant(String),
  /// The backend refused the write.
  #[error("checkpoint write rejected: {0}")]
  Rejected(String),
}

/// Storage backend for one stage's checkpoint.
pub trait CheckpointStore: Send + Sync {
  /// Returns the last saved checkpoint, or `None` on a cold start.
  fn load(&self) -> Result<Option<Vec<u8>>, CheckpointError>;

  /// Atomically replaces the saved checkpoint with `data`.
  fn save(&self, data: &[u8]) -> Result<(), CheckpointError>;
}

/// File-based checkpoint storage.
///
/// Writes go to a temporary file in the target directory, are flushed to
/// disk, then renamed over the checkpoint file.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
  path: PathBuf,
}

impl FileCheckpointStore {
  /// Creates a store backed by the file at `path`.
  pub fn new<P: AsRef<Path>>(path: P) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
    }
  }

  /// Creates the store for `stage_name` inside `dir`: `<dir>/<stage_name>_state.json`.
  pub fn for_stage<P: AsRef<Path>>(dir: P, stage_name: &str) -> Self {
    Self::new(dir.as_ref().join(checkpoint_file_name(stage_name)))
  }

  /// Path of the checkpoint file.
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn directory(&self) -> &Path {
    match self.path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent,
      _ => Path::new("."),
    }
  }
}

/// File name of the checkpoint for `stage_name`.
pub fn checkpoint_file_name(stage_name: &str) -> String {
  let safe_name = stage_name.replace(
    |c: char| !c.is_alphanumeric() && c != '_' && c != '-',
    "_",
  );
  format!("{}_state.json", safe_name)
}

impl CheckpointStore for FileCheckpointStore {
  fn load(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
    match fs::read(&self.path) {
      Ok(data) => Ok(Some(data)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  fn save(&self, data: &[u8]) -> Result<(), CheckpointError> {
    let dir = self.directory();
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(&self.path).map_err(|e| e.error)?;
    Ok(())
  }
}

/// In-memory checkpoint storage.
///
/// Clones share the same slot, so a "restarted" stage can recover what a
/// previous instance saved. Writes can be made to fail on demand.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
  inner: Arc<InMemoryInner>,
}

#[derive(Debug, Default)]
struct InMemoryInner {
  data: Mutex<Option<Vec<u8>>>,
  fail_saves: AtomicBool,
  saves: AtomicUsize,
}

impl InMemoryCheckpointStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes every following save fail (or succeed again).
  pub fn set_fail_saves(&self, fail: bool) {
    self.inner.fail_saves.store(fail, Ordering::SeqCst);
  }

  /// Number of successful saves.
  pub fn save_count(&self) -> usize {
    self.inner.saves.load(Ordering::SeqCst)
  }

  /// Last saved checkpoint, parsed as JSON.
  pub fn contents(&self) -> Option<serde_json::Value> {
    let data = self.inner.data.lock().ok()?;
    data
      .as_deref()
      .and_then(|bytes| serde_json::from_slice(bytes).ok())
  }
}

impl CheckpointStore for InMemoryCheckpointStore {
  fn load(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
    let data = self
      .inner
      .data
      .lock()
      .map_err(|e| CheckpointError::Rejected(e.to_string()))?;
    Ok(data.clone())
  }

  fn save(&self, data: &[u8]) -> Result<(), CheckpointError> {
    if self.inner.fail_saves.load(Ordering::SeqCst) {
      return Err(CheckpointError::Rejected("save failure injected".to_string()));
    }
    let mut slot = self
      .inner
      .data
      .lock()
      .map_err(|e| CheckpointError::Rejected(e.to_string()))?;
    *slot = Some(data.to_vec());
    self.inner.saves.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}
