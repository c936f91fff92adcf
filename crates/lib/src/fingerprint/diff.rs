//! Change detection over declared fingerprints.
//!
//! The engine holds the declarations recorded during `setup()` and
//! answers the scheduler's "is this task dirty?" question by comparing
//! freshly computed state against the persisted record of the last
//! successful run. After a run it persists the new record; for forced
//! runs it can prune outputs the previous run produced but the current
//! declaration no longer claims.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{FileStamp, Fingerprint, FingerprintDecl, FingerprintError, FingerprintKind, FingerprintStore};
use crate::task::TaskId;

pub struct DiffEngine {
  store: FingerprintStore,
  declared: HashMap<TaskId, (FingerprintDecl, u64)>,
}

impl DiffEngine {
  pub fn new(store: FingerprintStore) -> Self {
    Self {
      store,
      declared: HashMap::new(),
    }
  }

  /// Record what a task's current run considers relevant.
  ///
  /// Called once per task during `setup()`; later calls replace the
  /// declaration.
  pub fn record(&mut self, task: &TaskId, decl: FingerprintDecl, task_version: u64) {
    self.declared.insert(task.clone(), (decl, task_version));
  }

  pub fn declaration(&self, task: &TaskId) -> Option<&FingerprintDecl> {
    self.declared.get(task).map(|(decl, _)| decl)
  }

  /// Decide whether the task's main body must run.
  ///
  /// True when no fingerprint from a previous run exists, when the task
  /// version was bumped, or when any declared member differs from the
  /// persisted record. Kinds with no declared members never contribute.
  pub fn dirty(&self, task: &TaskId) -> Result<bool, FingerprintError> {
    let (decl, task_version) = self
      .declared
      .get(task)
      .ok_or_else(|| FingerprintError::NotRecorded(task.clone()))?;

    let Some(previous) = self.store.load(task)? else {
      debug!(task = %task, "no previous fingerprint; task is dirty");
      return Ok(true);
    };

    if previous.task_version != *task_version {
      debug!(
        task = %task,
        previous = previous.task_version,
        current = task_version,
        "task version changed"
      );
      return Ok(true);
    }

    for (name, text) in &decl.config {
      if previous.config.get(name) != Some(text) {
        debug!(task = %task, kind = %FingerprintKind::Config, member = %name, "fingerprint member differs");
        return Ok(true);
      }
    }

    for member in &decl.input {
      let current = FileStamp::capture(&member.path, member.trust_mtime)?;
      if previous.input.get(&member.path) != Some(&current) {
        debug!(task = %task, kind = %FingerprintKind::Input, member = %member.path.display(), "fingerprint member differs");
        return Ok(true);
      }
    }

    for member in &decl.output {
      let current = FileStamp::capture(&member.path, member.trust_mtime)?;
      if previous.output.get(&member.path) != Some(&current) {
        debug!(task = %task, kind = %FingerprintKind::Output, member = %member.path.display(), "fingerprint member differs");
        return Ok(true);
      }
    }

    for (name, value) in &decl.variables {
      if previous.variables.get(name) != Some(value) {
        debug!(task = %task, kind = %FingerprintKind::Variables, member = %name, "fingerprint member differs");
        return Ok(true);
      }
    }

    trace!(task = %task, "fingerprint unchanged");
    Ok(false)
  }

  /// Persist the fresh fingerprint after a successful run, replacing the
  /// previous record atomically.
  pub fn persist(&self, task: &TaskId) -> Result<(), FingerprintError> {
    let (decl, task_version) = self
      .declared
      .get(task)
      .ok_or_else(|| FingerprintError::NotRecorded(task.clone()))?;

    let fingerprint = Fingerprint::compute(decl, *task_version)?;
    self.store.save(task, &fingerprint)
  }

  /// Remove outputs of a previous run that the current declaration no
  /// longer claims, then sweep now-empty parent directories.
  ///
  /// Returns the removed paths. Intended for forced runs, where stale
  /// task-owned state must not leak into the fresh tree.
  pub fn prune(&self, task: &TaskId) -> Result<Vec<PathBuf>, FingerprintError> {
    let (decl, _) = self
      .declared
      .get(task)
      .ok_or_else(|| FingerprintError::NotRecorded(task.clone()))?;

    let Some(previous) = self.store.load(task)? else {
      return Ok(Vec::new());
    };

    let declared: BTreeSet<&PathBuf> = decl.output.iter().map(|member| &member.path).collect();
    let mut removed = Vec::new();

    for path in previous.output.keys() {
      if declared.contains(path) {
        continue;
      }

      let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
        Err(e) => {
          return Err(FingerprintError::Prune {
            path: path.clone(),
            source: e,
          });
        }
      };

      let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
      } else {
        fs::remove_file(path)
      };
      result.map_err(|e| FingerprintError::Prune {
        path: path.clone(),
        source: e,
      })?;

      debug!(task = %task, path = %path.display(), "removed stale output");
      removed.push(path.clone());
    }

    sweep_empty_parents(&removed);
    Ok(removed)
  }
}

/// Remove now-empty parent directories of pruned outputs, walking up as
/// long as directories stay empty.
fn sweep_empty_parents(removed: &[PathBuf]) {
  let parents: BTreeSet<PathBuf> = removed
    .iter()
    .filter_map(|path| path.parent().map(Path::to_path_buf))
    .collect();

  for parent in parents.iter().rev() {
    let mut dir = parent.clone();
    loop {
      let empty = match fs::read_dir(&dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
      };
      if !empty || fs::remove_dir(&dir).is_err() {
        break;
      }

      trace!(path = %dir.display(), "removed empty directory");
      match dir.parent() {
        Some(next) => dir = next.to_path_buf(),
        None => break,
      }
    }
  }
}
