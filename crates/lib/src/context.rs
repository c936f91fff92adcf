//! Per-build configuration and context.
//!
//! A build is configured once from a [`BuildConfig`] (deserialized by the
//! front end, or constructed directly) and every task hook receives a
//! reference to the same [`BuildContext`]. Control variables that many
//! tasks consult live in the context, never in process-wide state, so two
//! builds in one test process cannot observe each other.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory for persisted fingerprints within the metadata directory.
const FINGERPRINTS_DIR: &str = "fingerprints";

/// Lock file name within the metadata directory.
const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse config file '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// Static configuration of a single build.
///
/// All paths are explicit configuration inputs; the engine never derives
/// them from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
  /// Identifier of the build, e.g. a profile or flavor name.
  pub build_id: String,

  /// Root of the distribution tree being produced.
  pub root: PathBuf,

  /// Directory holding per-build metadata (fingerprints, lock file).
  pub metadata_dir: PathBuf,

  /// Directory backing the content cache.
  pub cache_dir: PathBuf,

  /// Content cache quota in bytes.
  pub cache_quota: u64,
}

impl BuildConfig {
  /// Load a config from a JSON file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
      path: path.to_path_buf(),
      source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      source: e,
    })
  }

  pub fn paths(&self) -> BuildPaths {
    BuildPaths {
      metadata_dir: self.metadata_dir.clone(),
    }
  }
}

/// Concrete metadata layout derived from a [`BuildConfig`].
#[derive(Debug, Clone)]
pub struct BuildPaths {
  metadata_dir: PathBuf,
}

impl BuildPaths {
  pub fn metadata_dir(&self) -> &Path {
    &self.metadata_dir
  }

  pub fn fingerprints_dir(&self) -> PathBuf {
    self.metadata_dir.join(FINGERPRINTS_DIR)
  }

  pub fn lock_path(&self) -> PathBuf {
    self.metadata_dir.join(LOCK_FILENAME)
  }
}

/// The context object threaded through every task hook.
///
/// Created once per build and passed by reference; hooks read the config
/// and the control variables from here.
#[derive(Debug)]
pub struct BuildContext {
  pub config: BuildConfig,
  variables: BTreeMap<String, serde_json::Value>,
}

impl BuildContext {
  pub fn new(config: BuildConfig) -> Self {
    Self {
      config,
      variables: BTreeMap::new(),
    }
  }

  pub fn paths(&self) -> BuildPaths {
    self.config.paths()
  }

  /// Set a control variable before the build starts.
  pub fn set_variable(&mut self, name: impl Into<String>, value: serde_json::Value) {
    self.variables.insert(name.into(), value);
  }

  pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
    self.variables.get(name)
  }

  pub fn variables(&self) -> &BTreeMap<String, serde_json::Value> {
    &self.variables
  }
}
