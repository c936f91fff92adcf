//! Task model: identifiers, relationship declarations, statuses,
//! protections, and the hook contract task implementations fulfill.
//!
//! Tasks are declared once per build from descriptors ([`TaskSpec`]) and
//! registered into a [`TaskTree`]. The descriptor carries everything the
//! resolver needs (capability tags, ordering constraints, the parent
//! edge); runtime behavior lives behind the [`TaskHooks`] trait.

mod tree;

pub use tree::{ProtectionError, Task, TaskTree, TreeError};

use std::collections::BTreeSet;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::context::BuildContext;
use crate::fingerprint::FingerprintDecl;

/// Unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for TaskId {
  fn from(value: &str) -> Self {
    TaskId(value.to_string())
  }
}

impl From<String> for TaskId {
  fn from(value: String) -> Self {
    TaskId(value)
  }
}

/// Bitmask of rejected status/enable transitions.
///
/// A set bit makes the corresponding transition fail with a
/// [`ProtectionError`] instead of silently flipping build semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Protection(u8);

impl Protection {
  pub const NONE: Protection = Protection(0);
  pub const ENABLE: Protection = Protection(1);
  pub const DISABLE: Protection = Protection(1 << 1);
  pub const FORCE: Protection = Protection(1 << 2);
  pub const SKIP: Protection = Protection(1 << 3);

  pub fn contains(self, other: Protection) -> bool {
    self.0 & other.0 == other.0
  }
}

impl BitOr for Protection {
  type Output = Protection;

  fn bitor(self, rhs: Protection) -> Protection {
    Protection(self.0 | rhs.0)
  }
}

/// Per-task execution status, set between resolution and execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
  /// Run when dirty.
  #[default]
  Default,

  /// Always run; `clean()` discards stale task-owned state first.
  Force,

  /// Never run the body; `setup()`/`apply()`/`verify()` still execute.
  Skip,
}

/// Kinds of relationship declarations between tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
  /// Source must follow every provider of the target capability.
  Requires,

  /// Ordering only: source precedes the target capability/task.
  ComesBefore,

  /// Ordering only: source follows the target capability/task.
  ComesAfter,
}

/// A single relationship record.
///
/// Transient: these only exist while the resolver is matching
/// declarations against providers; unresolved ones surface in errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
  pub source: TaskId,
  pub target: String,
  pub kind: RelationKind,
}

impl std::fmt::Display for Relation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.kind {
      RelationKind::Requires => write!(f, "task '{}' requires capability '{}'", self.source, self.target),
      RelationKind::ComesBefore => write!(f, "task '{}' comes before '{}'", self.source, self.target),
      RelationKind::ComesAfter => write!(f, "task '{}' comes after '{}'", self.source, self.target),
    }
  }
}

/// Declarative task descriptor.
///
/// Specs are plain data: front ends build them from parsed definitions
/// and hand them to [`TaskTree::register`] together with the hook
/// implementation. No task classes are synthesized at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
  pub id: TaskId,
  pub parent: Option<TaskId>,

  /// Pure grouping node; status/enable changes cascade to children.
  pub meta: bool,

  /// Monotonic version; bumping it makes the task dirty downstream.
  pub version: u64,

  pub protection: Protection,

  pub provides: BTreeSet<String>,
  pub requires: BTreeSet<String>,
  pub comes_before: BTreeSet<String>,
  pub comes_after: BTreeSet<String>,

  /// Honored only if the target capability exists somewhere in the task
  /// set; silently dropped otherwise.
  pub conditional_requires: BTreeSet<String>,
  pub conditional_comes_before: BTreeSet<String>,
  pub conditional_comes_after: BTreeSet<String>,
}

impl TaskSpec {
  pub fn new(id: impl Into<TaskId>) -> Self {
    Self {
      id: id.into(),
      parent: None,
      meta: false,
      version: 0,
      protection: Protection::NONE,
      provides: BTreeSet::new(),
      requires: BTreeSet::new(),
      comes_before: BTreeSet::new(),
      comes_after: BTreeSet::new(),
      conditional_requires: BTreeSet::new(),
      conditional_comes_before: BTreeSet::new(),
      conditional_comes_after: BTreeSet::new(),
    }
  }

  pub fn parent(mut self, parent: impl Into<TaskId>) -> Self {
    self.parent = Some(parent.into());
    self
  }

  pub fn meta(mut self) -> Self {
    self.meta = true;
    self
  }

  pub fn version(mut self, version: u64) -> Self {
    self.version = version;
    self
  }

  pub fn protect(mut self, protection: Protection) -> Self {
    self.protection = self.protection | protection;
    self
  }

  pub fn provides(mut self, capability: impl Into<String>) -> Self {
    self.provides.insert(capability.into());
    self
  }

  pub fn requires(mut self, capability: impl Into<String>) -> Self {
    self.requires.insert(capability.into());
    self
  }

  pub fn comes_before(mut self, target: impl Into<String>) -> Self {
    self.comes_before.insert(target.into());
    self
  }

  pub fn comes_after(mut self, target: impl Into<String>) -> Self {
    self.comes_after.insert(target.into());
    self
  }

  pub fn conditionally_requires(mut self, capability: impl Into<String>) -> Self {
    self.conditional_requires.insert(capability.into());
    self
  }

  pub fn conditionally_comes_before(mut self, target: impl Into<String>) -> Self {
    self.conditional_comes_before.insert(target.into());
    self
  }

  pub fn conditionally_comes_after(mut self, target: impl Into<String>) -> Self {
    self.conditional_comes_after.insert(target.into());
    self
  }
}

/// Result type of task hooks; userland failures carry arbitrary causes.
pub type HookResult = Result<(), anyhow::Error>;

/// Lifecycle hooks a task implementation may provide.
///
/// All hooks default to no-ops, so pure grouping or marker tasks need no
/// implementation of their own. The scheduler drives the lifecycle; see
/// the `scheduler` module for the exact sequence per status.
pub trait TaskHooks {
  /// Prepare the task; runs for every non-disabled task.
  fn setup(&mut self, _ctx: &BuildContext) -> HookResult {
    Ok(())
  }

  /// Declare what this run considers relevant for change detection.
  fn fingerprint(&self, _ctx: &BuildContext) -> FingerprintDecl {
    FingerprintDecl::default()
  }

  /// The main body; only runs when the task is dirty or forced.
  fn run(&mut self, _ctx: &BuildContext) -> HookResult {
    Ok(())
  }

  /// Publish results into the build tree; always runs.
  fn apply(&mut self, _ctx: &BuildContext) -> HookResult {
    Ok(())
  }

  /// Best-effort validation; failures are reported, never fatal.
  fn verify(&mut self, _ctx: &BuildContext) -> HookResult {
    Ok(())
  }

  /// Discard stale task-owned state before a forced run.
  fn clean(&mut self, _ctx: &BuildContext) -> HookResult {
    Ok(())
  }

  /// Last-chance state preservation when another hook failed; the
  /// original error is re-raised afterwards.
  fn error(&mut self, _ctx: &BuildContext, _error: &anyhow::Error) {}
}

/// Hook implementation with no behavior, for grouping tasks.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl TaskHooks for NoopHooks {}
