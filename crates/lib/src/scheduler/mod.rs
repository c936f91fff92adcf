//! The execution loop over the resolved task order.
//!
//! Scheduling is strictly single-threaded: tasks run one at a time in
//! resolver order, each completing its whole lifecycle before the next
//! starts. The per-task lifecycle is:
//!
//! ```text
//! setup() ──► record fingerprint declaration
//!    status skip  ─────────────────────────────► apply() ─► verify()
//!    status force ─► clean() ─► prune ─► run() ─► apply() ─► verify()
//!    otherwise    ─► dirty? ── yes ───► run() ─► apply() ─► verify()
//!                          └── no ──────────────► apply() ─► verify()
//! ```
//!
//! `run()` is followed by persisting the fresh fingerprint; `verify()`
//! is best-effort and never aborts the build. Any other hook failure
//! invokes the task's `error()` hook for state preservation and then
//! aborts the whole build; completed tasks keep their fingerprints.
//!
//! The entire build holds an exclusive advisory lock. The lock guard is
//! bound for the duration of `run`, so it is released on every exit
//! path.

mod types;

pub use types::{BuildReport, HookPhase, SchedulerError};

use tracing::{debug, info, warn};

use crate::context::BuildContext;
use crate::fingerprint::{DiffEngine, FingerprintStore};
use crate::lock::{BuildLock, LockMode};
use crate::resolver;
use crate::task::{Task, TaskStatus, TaskTree};

pub struct Scheduler {
  diff: DiffEngine,
}

impl Scheduler {
  pub fn new(ctx: &BuildContext) -> Self {
    Self {
      diff: DiffEngine::new(FingerprintStore::new(ctx.paths().fingerprints_dir())),
    }
  }

  pub fn diff(&self) -> &DiffEngine {
    &self.diff
  }

  /// Run one build: resolve the order, then drive every task through its
  /// lifecycle.
  pub fn run(&mut self, tree: &mut TaskTree, ctx: &BuildContext) -> Result<BuildReport, SchedulerError> {
    let lock_path = ctx.paths().lock_path();
    let _lock = BuildLock::acquire(&lock_path, LockMode::Exclusive, &ctx.config.build_id, "build")?;

    let order = resolver::resolve(tree)?;
    info!(build = %ctx.config.build_id, tasks = order.len(), "starting build");

    let mut report = BuildReport::default();

    for id in order {
      let task = tree.get_mut(&id).expect("resolved task is registered");

      // Meta tasks are pure grouping nodes; nothing to execute.
      if task.spec().meta {
        continue;
      }

      if !task.enabled() {
        debug!(task = %id, "task disabled");
        report.disabled.push(id);
        continue;
      }

      let status = task.status();
      let version = task.spec().version;

      run_hook(task, ctx, HookPhase::Setup)?;
      let decl = task.hooks().fingerprint(ctx);
      self.diff.record(&id, decl, version);

      match status {
        TaskStatus::Skip => {
          debug!(task = %id, "status skip; run suppressed");
          report.skipped.push(id.clone());
        }
        TaskStatus::Force => {
          run_hook(task, ctx, HookPhase::Clean)?;
          let pruned = self.diff.prune(&id)?;
          if !pruned.is_empty() {
            debug!(task = %id, count = pruned.len(), "pruned stale outputs");
          }

          run_hook(task, ctx, HookPhase::Run)?;
          self.diff.persist(&id)?;
          report.executed.push(id.clone());
        }
        TaskStatus::Default => {
          if self.diff.dirty(&id)? {
            run_hook(task, ctx, HookPhase::Run)?;
            self.diff.persist(&id)?;
            report.executed.push(id.clone());
          } else {
            debug!(task = %id, "fingerprint unchanged; run skipped");
            report.unchanged.push(id.clone());
          }
        }
      }

      run_hook(task, ctx, HookPhase::Apply)?;

      if let Err(error) = task.hooks_mut().verify(ctx) {
        warn!(task = %id, error = %error, "verify failed");
        report.verify_failures.push((id.clone(), error.to_string()));
      }
    }

    info!(
      build = %ctx.config.build_id,
      executed = report.executed.len(),
      unchanged = report.unchanged.len(),
      "build finished"
    );
    Ok(report)
  }
}

/// Run one fatal-on-error hook: on failure the task's `error()` hook
/// gets a chance to preserve state, then the error propagates.
fn run_hook(task: &mut Task, ctx: &BuildContext, phase: HookPhase) -> Result<(), SchedulerError> {
  let result = match phase {
    HookPhase::Setup => task.hooks_mut().setup(ctx),
    HookPhase::Clean => task.hooks_mut().clean(ctx),
    HookPhase::Run => task.hooks_mut().run(ctx),
    HookPhase::Apply => task.hooks_mut().apply(ctx),
    HookPhase::Verify => task.hooks_mut().verify(ctx),
  };

  if let Err(source) = result {
    let id = task.id().clone();
    warn!(task = %id, phase = %phase, "task hook failed; invoking error hook");
    task.hooks_mut().error(ctx, &source);
    return Err(SchedulerError::Hook {
      task: id,
      phase,
      source,
    });
  }

  Ok(())
}
