//! Types for build execution.
//!
//! This module defines the error types and the per-build report the
//! scheduler produces.

use thiserror::Error;

use crate::fingerprint::FingerprintError;
use crate::lock::LockError;
use crate::resolver::ResolveError;
use crate::task::TaskId;

/// Lifecycle phase a hook error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
  Setup,
  Clean,
  Run,
  Apply,
  Verify,
}

impl std::fmt::Display for HookPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      HookPhase::Setup => "setup",
      HookPhase::Clean => "clean",
      HookPhase::Run => "run",
      HookPhase::Apply => "apply",
      HookPhase::Verify => "verify",
    };
    write!(f, "{}", name)
  }
}

/// Errors that abort a build.
#[derive(Debug, Error)]
pub enum SchedulerError {
  /// Another process holds the build lock.
  #[error(transparent)]
  Lock(#[from] LockError),

  /// The task set could not be resolved into an order.
  #[error(transparent)]
  Resolve(#[from] ResolveError),

  /// Fingerprint bookkeeping failed.
  #[error(transparent)]
  Fingerprint(#[from] FingerprintError),

  /// A task hook raised; the task's `error()` hook already ran.
  #[error("task '{task}' failed in {phase}: {source}")]
  Hook {
    task: TaskId,
    phase: HookPhase,
    #[source]
    source: anyhow::Error,
  },
}

/// Outcome of one build, task by task.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Tasks whose body ran (dirty or forced).
  pub executed: Vec<TaskId>,

  /// Tasks whose fingerprint was unchanged; body skipped.
  pub unchanged: Vec<TaskId>,

  /// Tasks suppressed by `status == skip`.
  pub skipped: Vec<TaskId>,

  /// Tasks that were disabled entirely.
  pub disabled: Vec<TaskId>,

  /// Best-effort verification failures; the build still completed.
  pub verify_failures: Vec<(TaskId, String)>,
}

impl BuildReport {
  /// Total number of tasks the scheduler visited.
  pub fn total(&self) -> usize {
    self.executed.len() + self.unchanged.len() + self.skipped.len() + self.disabled.len()
  }

  /// True when every verification passed.
  pub fn is_clean(&self) -> bool {
    self.verify_failures.is_empty()
  }
}
