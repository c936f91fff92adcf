//! Per-task fingerprints and the incremental-change engine.
//!
//! A task declares what its run depends on (configuration text, input
//! files, produced output files, arbitrary variables) during `setup()`.
//! After a successful run the computed [`Fingerprint`] is persisted; on
//! the next build the [`DiffEngine`](diff::DiffEngine) compares the
//! fresh state against the persisted record to decide whether the task
//! body has to run again.
//!
//! # Comparison rules
//!
//! - `config` members differ when their serialized text differs byte for
//!   byte.
//! - `input`/`output` members differ when the file vanished or its
//!   size/mtime/mode triple changed; members flagged as having an
//!   untrusted mtime are compared by content hash instead.
//! - `variables` members differ under deep JSON equality.
//!
//! A kind with no declared members never blocks execution.

mod diff;
mod store;

pub use diff::DiffEngine;
pub use store::{FingerprintError, FingerprintStore};

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::{DirHashError, HashFileError, hash_directory, hash_file};

/// Schema version of persisted fingerprint records.
pub const FINGERPRINT_VERSION: u32 = 1;

/// The four independent fingerprint kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintKind {
  Config,
  Input,
  Output,
  Variables,
}

impl std::fmt::Display for FingerprintKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      FingerprintKind::Config => "config",
      FingerprintKind::Input => "input",
      FingerprintKind::Output => "output",
      FingerprintKind::Variables => "variables",
    };
    write!(f, "{}", name)
  }
}

/// Error while stamping a declared file member.
#[derive(Debug, Error)]
pub enum StampError {
  #[error("failed to stat '{path}': {source}")]
  Stat {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  HashFile(#[from] HashFileError),

  #[error(transparent)]
  HashDir(#[from] DirHashError),
}

/// The on-disk state recorded for one input or output member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStamp {
  /// The member does not exist.
  Missing,

  /// size/mtime/mode triple; the cheap default.
  Stat {
    size: u64,
    mtime_secs: u64,
    mtime_nanos: u32,
    mode: u32,
  },

  /// Content hash; used when the member's mtime is untrusted (e.g. files
  /// fetched from a source with clock skew).
  Content { size: u64, sha256: String },
}

impl FileStamp {
  /// Capture the current stamp of `path`.
  ///
  /// A missing member yields [`FileStamp::Missing`]; any other stat
  /// failure is an error.
  pub fn capture(path: &Path, trust_mtime: bool) -> Result<FileStamp, StampError> {
    let metadata = match fs::metadata(path) {
      Ok(metadata) => metadata,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileStamp::Missing),
      Err(e) => {
        return Err(StampError::Stat {
          path: path.to_path_buf(),
          source: e,
        });
      }
    };

    if trust_mtime {
      let mtime = metadata
        .modified()
        .map_err(|e| StampError::Stat {
          path: path.to_path_buf(),
          source: e,
        })?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

      return Ok(FileStamp::Stat {
        size: metadata.len(),
        mtime_secs: mtime.as_secs(),
        mtime_nanos: mtime.subsec_nanos(),
        mode: file_mode(&metadata),
      });
    }

    if metadata.is_dir() {
      Ok(FileStamp::Content {
        size: 0,
        sha256: hash_directory(path)?.0,
      })
    } else {
      Ok(FileStamp::Content {
        size: metadata.len(),
        sha256: hash_file(path)?.0,
      })
    }
  }
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
  use std::os::unix::fs::MetadataExt;
  metadata.mode()
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
  0
}

/// One declared input or output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMember {
  pub path: PathBuf,
  pub trust_mtime: bool,
}

impl FileMember {
  /// A member compared by its size/mtime/mode triple.
  pub fn stat(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      trust_mtime: true,
    }
  }

  /// A member compared by content hash (untrusted mtime).
  pub fn hashed(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      trust_mtime: false,
    }
  }
}

/// What a task declares as relevant for the current run.
///
/// This is the fingerprint declaration contract: four named member
/// collections, each possibly empty. Collected during `setup()`.
#[derive(Debug, Clone, Default)]
pub struct FingerprintDecl {
  pub config: BTreeMap<String, String>,
  pub input: Vec<FileMember>,
  pub output: Vec<FileMember>,
  pub variables: BTreeMap<String, serde_json::Value>,
}

impl FingerprintDecl {
  pub fn new() -> Self {
    Self::default()
  }

  /// Declare a configuration subtree by its serialized text.
  pub fn config(mut self, name: impl Into<String>, serialized: impl Into<String>) -> Self {
    self.config.insert(name.into(), serialized.into());
    self
  }

  pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
    self.input.push(FileMember::stat(path));
    self
  }

  /// Declare an input whose mtime cannot be trusted.
  pub fn hashed_input(mut self, path: impl Into<PathBuf>) -> Self {
    self.input.push(FileMember::hashed(path));
    self
  }

  pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
    self.output.push(FileMember::stat(path));
    self
  }

  pub fn variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
    self.variables.insert(name.into(), value);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.config.is_empty() && self.input.is_empty() && self.output.is_empty() && self.variables.is_empty()
  }
}

/// The persisted snapshot of one task's last successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
  /// Record schema version.
  pub version: u32,

  /// The task's declared version number at record time.
  pub task_version: u64,

  pub config: BTreeMap<String, String>,
  pub input: BTreeMap<PathBuf, FileStamp>,
  pub output: BTreeMap<PathBuf, FileStamp>,
  pub variables: BTreeMap<String, serde_json::Value>,
}

impl Fingerprint {
  /// Compute a fresh fingerprint from a declaration against current
  /// on-disk state.
  pub fn compute(decl: &FingerprintDecl, task_version: u64) -> Result<Self, StampError> {
    let mut input = BTreeMap::new();
    for member in &decl.input {
      input.insert(member.path.clone(), FileStamp::capture(&member.path, member.trust_mtime)?);
    }

    let mut output = BTreeMap::new();
    for member in &decl.output {
      output.insert(member.path.clone(), FileStamp::capture(&member.path, member.trust_mtime)?);
    }

    Ok(Self {
      version: FINGERPRINT_VERSION,
      task_version,
      config: decl.config.clone(),
      input,
      output,
      variables: decl.variables.clone(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn capture_missing_member() {
    let temp = tempdir().unwrap();
    let stamp = FileStamp::capture(&temp.path().join("absent"), true).unwrap();
    assert_eq!(stamp, FileStamp::Missing);
  }

  #[test]
  fn capture_stat_stamp() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("file.txt");
    fs::write(&path, "twelve bytes").unwrap();

    match FileStamp::capture(&path, true).unwrap() {
      FileStamp::Stat { size, .. } => assert_eq!(size, 12),
      other => panic!("expected stat stamp, got {:?}", other),
    }
  }

  #[test]
  fn capture_content_stamp_for_untrusted_mtime() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("fetched.img");
    fs::write(&path, "image payload").unwrap();

    match FileStamp::capture(&path, false).unwrap() {
      FileStamp::Content { size, sha256 } => {
        assert_eq!(size, 13);
        assert_eq!(sha256.len(), 64);
      }
      other => panic!("expected content stamp, got {:?}", other),
    }
  }

  #[test]
  fn content_stamp_ignores_touched_mtime() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("fetched.img");
    fs::write(&path, "image payload").unwrap();

    let before = FileStamp::capture(&path, false).unwrap();
    // Rewrite identical bytes; mtime moves, content does not.
    fs::write(&path, "image payload").unwrap();
    let after = FileStamp::capture(&path, false).unwrap();

    assert_eq!(before, after);
  }

  #[test]
  fn declaration_builder_collects_members() {
    let decl = FingerprintDecl::new()
      .config("packages", "<packages>bash</packages>")
      .input("/srv/input.img")
      .hashed_input("/srv/fetched.img")
      .output("/srv/tree/boot")
      .variable("arch", serde_json::json!("x86_64"));

    assert!(!decl.is_empty());
    assert_eq!(decl.input.len(), 2);
    assert!(decl.input[0].trust_mtime);
    assert!(!decl.input[1].trust_mtime);
    assert_eq!(decl.output.len(), 1);
  }

  #[test]
  fn compute_snapshots_declared_members() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("in.txt");
    fs::write(&input, "in").unwrap();

    let decl = FingerprintDecl::new()
      .input(&input)
      .output(temp.path().join("not-yet-produced"))
      .variable("release", serde_json::json!(15));

    let fingerprint = Fingerprint::compute(&decl, 3).unwrap();
    assert_eq!(fingerprint.version, FINGERPRINT_VERSION);
    assert_eq!(fingerprint.task_version, 3);
    assert!(matches!(fingerprint.input[&input], FileStamp::Stat { .. }));
    assert_eq!(fingerprint.output[&temp.path().join("not-yet-produced")], FileStamp::Missing);
  }
}
