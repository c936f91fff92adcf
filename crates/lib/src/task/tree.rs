//! The task tree: registry, parent/child edges, and status control.
//!
//! Status and enable changes go through the tree so cascade and
//! protection logic lives in exactly one place. A change applied to a
//! meta task cascades to all of its descendants; the meta's own
//! protection bits are not consulted, but every affected non-meta task
//! checks its own bitmask. A protected descendant aborts the cascade with
//! a [`ProtectionError`], leaving already-applied changes in place.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use super::{Protection, TaskHooks, TaskId, TaskSpec, TaskStatus};

/// An attempted status or enable change violated a task's protection
/// bitmask.
#[derive(Debug, Error)]
#[error("task '{task}' is protected against {change}")]
pub struct ProtectionError {
  pub task: TaskId,
  pub change: &'static str,
}

#[derive(Debug, Error)]
pub enum TreeError {
  #[error("duplicate task id '{0}'")]
  Duplicate(TaskId),

  #[error("task '{task}' names unknown parent '{parent}'")]
  UnknownParent { task: TaskId, parent: TaskId },

  #[error("unknown task id '{0}'")]
  Unknown(TaskId),

  #[error(transparent)]
  Protection(#[from] ProtectionError),
}

/// A registered task: descriptor, mutable run state, and hooks.
pub struct Task {
  spec: TaskSpec,
  enabled: bool,
  status: TaskStatus,
  hooks: Box<dyn TaskHooks>,
}

impl Task {
  fn new(spec: TaskSpec, hooks: Box<dyn TaskHooks>) -> Self {
    Self {
      spec,
      enabled: true,
      status: TaskStatus::Default,
      hooks,
    }
  }

  pub fn id(&self) -> &TaskId {
    &self.spec.id
  }

  pub fn spec(&self) -> &TaskSpec {
    &self.spec
  }

  pub fn enabled(&self) -> bool {
    self.enabled
  }

  pub fn status(&self) -> TaskStatus {
    self.status
  }

  pub fn hooks(&self) -> &dyn TaskHooks {
    self.hooks.as_ref()
  }

  pub fn hooks_mut(&mut self) -> &mut dyn TaskHooks {
    self.hooks.as_mut()
  }
}

impl std::fmt::Debug for Task {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Task")
      .field("id", &self.spec.id)
      .field("enabled", &self.enabled)
      .field("status", &self.status)
      .finish_non_exhaustive()
  }
}

/// The hierarchy of tasks for one build.
///
/// Parents must be registered before their children; parent edges are
/// fixed at registration.
#[derive(Debug, Default)]
pub struct TaskTree {
  tasks: Vec<Task>,
  index: HashMap<TaskId, usize>,
  children: HashMap<TaskId, Vec<TaskId>>,
  roots: Vec<TaskId>,
}

impl TaskTree {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a task from its descriptor and hook implementation.
  pub fn register(&mut self, spec: TaskSpec, hooks: Box<dyn TaskHooks>) -> Result<(), TreeError> {
    if self.index.contains_key(&spec.id) {
      return Err(TreeError::Duplicate(spec.id.clone()));
    }

    match &spec.parent {
      Some(parent) => {
        if !self.index.contains_key(parent) {
          return Err(TreeError::UnknownParent {
            task: spec.id.clone(),
            parent: parent.clone(),
          });
        }
        self.children.entry(parent.clone()).or_default().push(spec.id.clone());
      }
      None => self.roots.push(spec.id.clone()),
    }

    self.index.insert(spec.id.clone(), self.tasks.len());
    self.tasks.push(Task::new(spec, hooks));
    Ok(())
  }

  pub fn get(&self, id: &TaskId) -> Option<&Task> {
    self.index.get(id).map(|&i| &self.tasks[i])
  }

  pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
    let i = *self.index.get(id)?;
    Some(&mut self.tasks[i])
  }

  /// All task ids in registration order.
  pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
    self.tasks.iter().map(Task::id)
  }

  pub fn tasks(&self) -> impl Iterator<Item = &Task> {
    self.tasks.iter()
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  pub fn roots(&self) -> &[TaskId] {
    &self.roots
  }

  pub fn children(&self, id: &TaskId) -> &[TaskId] {
    self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
  }

  /// All descendants of a task, breadth-first in registration order.
  pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
    let mut out = Vec::new();
    let mut queue: std::collections::VecDeque<TaskId> = self.children(id).iter().cloned().collect();

    while let Some(next) = queue.pop_front() {
      queue.extend(self.children(&next).iter().cloned());
      out.push(next);
    }

    out
  }

  /// Change a task's status.
  ///
  /// Meta tasks cascade the change to every descendant.
  pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) -> Result<(), TreeError> {
    let task = self.get(id).ok_or_else(|| TreeError::Unknown(id.clone()))?;

    if task.spec.meta {
      debug!(task = %id, ?status, "cascading status through meta task");
      self.apply_status(id, status)?;
      for descendant in self.descendants(id) {
        self.apply_status(&descendant, status)?;
      }
      return Ok(());
    }

    Ok(self.apply_status(id, status)?)
  }

  /// Enable a task (and, for meta tasks, all descendants).
  pub fn enable(&mut self, id: &TaskId) -> Result<(), TreeError> {
    self.set_enabled(id, true)
  }

  /// Disable a task (and, for meta tasks, all descendants).
  pub fn disable(&mut self, id: &TaskId) -> Result<(), TreeError> {
    self.set_enabled(id, false)
  }

  fn set_enabled(&mut self, id: &TaskId, enabled: bool) -> Result<(), TreeError> {
    let task = self.get(id).ok_or_else(|| TreeError::Unknown(id.clone()))?;

    if task.spec.meta {
      debug!(task = %id, enabled, "cascading enable state through meta task");
      self.apply_enabled(id, enabled)?;
      for descendant in self.descendants(id) {
        self.apply_enabled(&descendant, enabled)?;
      }
      return Ok(());
    }

    Ok(self.apply_enabled(id, enabled)?)
  }

  fn apply_status(&mut self, id: &TaskId, status: TaskStatus) -> Result<(), ProtectionError> {
    let task = self.get_mut(id).expect("status target registered");

    if !task.spec.meta {
      let rejected = match status {
        TaskStatus::Force if task.spec.protection.contains(Protection::FORCE) => Some("force"),
        TaskStatus::Skip if task.spec.protection.contains(Protection::SKIP) => Some("skip"),
        _ => None,
      };
      if let Some(change) = rejected {
        return Err(ProtectionError {
          task: id.clone(),
          change,
        });
      }
    }

    task.status = status;
    Ok(())
  }

  fn apply_enabled(&mut self, id: &TaskId, enabled: bool) -> Result<(), ProtectionError> {
    let task = self.get_mut(id).expect("enable target registered");

    if !task.spec.meta {
      let bit = if enabled { Protection::ENABLE } else { Protection::DISABLE };
      if task.spec.protection.contains(bit) {
        return Err(ProtectionError {
          task: id.clone(),
          change: if enabled { "enable" } else { "disable" },
        });
      }
    }

    task.enabled = enabled;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::NoopHooks;

  fn register(tree: &mut TaskTree, spec: TaskSpec) {
    tree.register(spec, Box::new(NoopHooks)).unwrap();
  }

  fn sample_tree() -> TaskTree {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("root").meta());
    register(&mut tree, TaskSpec::new("packages").parent("root"));
    register(&mut tree, TaskSpec::new("bootloader").parent("root"));
    tree
  }

  #[test]
  fn registration_tracks_roots_and_children() {
    let tree = sample_tree();

    assert_eq!(tree.len(), 3);
    assert_eq!(tree.roots(), &[TaskId::from("root")]);
    assert_eq!(
      tree.children(&TaskId::from("root")),
      &[TaskId::from("packages"), TaskId::from("bootloader")]
    );
    assert!(tree.children(&TaskId::from("packages")).is_empty());
  }

  #[test]
  fn duplicate_id_is_rejected() {
    let mut tree = sample_tree();
    let err = tree.register(TaskSpec::new("packages"), Box::new(NoopHooks)).unwrap_err();
    assert!(matches!(err, TreeError::Duplicate(_)));
  }

  #[test]
  fn unknown_parent_is_rejected() {
    let mut tree = TaskTree::new();
    let err = tree
      .register(TaskSpec::new("orphan").parent("nowhere"), Box::new(NoopHooks))
      .unwrap_err();
    assert!(matches!(err, TreeError::UnknownParent { .. }));
  }

  #[test]
  fn status_change_on_leaf() {
    let mut tree = sample_tree();
    let id = TaskId::from("packages");

    tree.set_status(&id, TaskStatus::Force).unwrap();
    assert_eq!(tree.get(&id).unwrap().status(), TaskStatus::Force);
  }

  #[test]
  fn protection_rejects_status_change() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("signed").protect(Protection::FORCE | Protection::SKIP));

    let id = TaskId::from("signed");
    assert!(tree.set_status(&id, TaskStatus::Force).is_err());
    assert!(tree.set_status(&id, TaskStatus::Skip).is_err());
    // Resetting to the default status is never protected.
    tree.set_status(&id, TaskStatus::Default).unwrap();
  }

  #[test]
  fn meta_status_cascades_to_descendants() {
    let mut tree = sample_tree();
    register(&mut tree, TaskSpec::new("grub").parent("bootloader"));

    tree.set_status(&TaskId::from("root"), TaskStatus::Skip).unwrap();

    for id in ["packages", "bootloader", "grub"] {
      assert_eq!(tree.get(&TaskId::from(id)).unwrap().status(), TaskStatus::Skip);
    }
  }

  #[test]
  fn cascade_stops_at_protected_descendant() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("root").meta());
    register(&mut tree, TaskSpec::new("first").parent("root"));
    register(&mut tree, TaskSpec::new("locked").parent("root").protect(Protection::SKIP));

    let err = tree.set_status(&TaskId::from("root"), TaskStatus::Skip).unwrap_err();
    assert!(matches!(err, TreeError::Protection(_)));

    // Descendants reached before the protected one keep the change.
    assert_eq!(tree.get(&TaskId::from("first")).unwrap().status(), TaskStatus::Skip);
    assert_eq!(tree.get(&TaskId::from("locked")).unwrap().status(), TaskStatus::Default);
  }

  #[test]
  fn meta_own_protection_is_not_consulted() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("group").meta().protect(Protection::SKIP));
    register(&mut tree, TaskSpec::new("inner").parent("group"));

    tree.set_status(&TaskId::from("group"), TaskStatus::Skip).unwrap();
    assert_eq!(tree.get(&TaskId::from("inner")).unwrap().status(), TaskStatus::Skip);
  }

  #[test]
  fn disable_cascades_and_respects_protection() {
    let mut tree = sample_tree();
    register(&mut tree, TaskSpec::new("keep").parent("root").protect(Protection::DISABLE));

    let err = tree.disable(&TaskId::from("root")).unwrap_err();
    assert!(matches!(err, TreeError::Protection(_)));
    assert!(!tree.get(&TaskId::from("packages")).unwrap().enabled());
    assert!(tree.get(&TaskId::from("keep")).unwrap().enabled());

    tree.enable(&TaskId::from("packages")).unwrap();
    assert!(tree.get(&TaskId::from("packages")).unwrap().enabled());
  }
}
