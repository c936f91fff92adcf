//! Fingerprint persistence.
//!
//! Handles reading and writing per-task fingerprint records.
//!
//! # Storage Layout
//!
//! ```text
//! {metadata_dir}/fingerprints/
//! └── <task id>.json        # Fingerprint of the last successful run
//! ```
//!
//! Records are written atomically (temp file, then rename). A record that
//! fails to deserialize is deleted and treated as absent, which makes the
//! owning task dirty on its next check — first-run semantics instead of a
//! poisoned build.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use super::{FINGERPRINT_VERSION, Fingerprint, StampError};
use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum FingerprintError {
  #[error("failed to create fingerprint directory '{path}': {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read fingerprint '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write fingerprint '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize fingerprint for task '{task}': {source}")]
  Serialize {
    task: TaskId,
    #[source]
    source: serde_json::Error,
  },

  #[error("no fingerprint declaration recorded for task '{0}'")]
  NotRecorded(TaskId),

  #[error(transparent)]
  Stamp(#[from] StampError),

  #[error("failed to remove stale output '{path}': {source}")]
  Prune {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Manages fingerprint records on disk, one JSON file per task id.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
  base_path: PathBuf,
}

impl FingerprintStore {
  pub fn new(base_path: PathBuf) -> Self {
    Self { base_path }
  }

  fn record_path(&self, task: &TaskId) -> PathBuf {
    self.base_path.join(format!("{}.json", task))
  }

  fn ensure_dir(&self) -> Result<(), FingerprintError> {
    fs::create_dir_all(&self.base_path).map_err(|e| FingerprintError::CreateDir {
      path: self.base_path.clone(),
      source: e,
    })
  }

  /// Load the persisted fingerprint of a task.
  ///
  /// Returns `Ok(None)` if no record exists. A corrupt or
  /// incompatible-schema record is deleted and reported as absent.
  pub fn load(&self, task: &TaskId) -> Result<Option<Fingerprint>, FingerprintError> {
    let path = self.record_path(task);

    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(FingerprintError::Read { path, source: e }),
    };

    let fingerprint: Fingerprint = match serde_json::from_str(&content) {
      Ok(fingerprint) => fingerprint,
      Err(e) => {
        warn!(task = %task, path = %path.display(), error = %e, "deleting corrupt fingerprint record");
        fs::remove_file(&path).map_err(|e| FingerprintError::Write { path, source: e })?;
        return Ok(None);
      }
    };

    if fingerprint.version != FINGERPRINT_VERSION {
      warn!(
        task = %task,
        found = fingerprint.version,
        expected = FINGERPRINT_VERSION,
        "discarding fingerprint with incompatible schema"
      );
      return Ok(None);
    }

    Ok(Some(fingerprint))
  }

  /// Atomically replace the persisted fingerprint of a task.
  pub fn save(&self, task: &TaskId, fingerprint: &Fingerprint) -> Result<(), FingerprintError> {
    self.ensure_dir()?;

    let path = self.record_path(task);
    let temp_path = self.base_path.join(format!("{}.json.tmp", task));

    let content = serde_json::to_string_pretty(fingerprint).map_err(|e| FingerprintError::Serialize {
      task: task.clone(),
      source: e,
    })?;
    fs::write(&temp_path, &content).map_err(|e| FingerprintError::Write {
      path: temp_path.clone(),
      source: e,
    })?;
    fs::rename(&temp_path, &path).map_err(|e| FingerprintError::Write { path, source: e })?;

    Ok(())
  }

  /// Remove the persisted fingerprint of a task, if any.
  pub fn delete(&self, task: &TaskId) -> Result<(), FingerprintError> {
    let path = self.record_path(task);

    match fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(FingerprintError::Write { path, source: e }),
    }
  }
}
