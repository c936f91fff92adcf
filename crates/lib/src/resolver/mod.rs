//! Hierarchical dependency resolution.
//!
//! The resolver turns declared task relationships into a total execution
//! order. Resolution is recursive over the task tree: every sibling
//! group ("scope") is resolved on its own, seeded with the enclosing
//! task's provides/id as implicit background. A scope returns three
//! things — the order of its subtree, the capabilities it provides
//! (children's capabilities are attributed to their parent), and the
//! residual relations it could not match locally. Residuals are retried
//! one scope up, re-anchored to the child's representative member, so an
//! aunt or cousin can satisfy what a nested task asked for. Residuals
//! that survive the top scope are unresolved and reported in full.
//!
//! Conditional relations are matched against the *whole* task set before
//! resolution starts and dropped silently when their target capability
//! or task id appears nowhere. Capabilities of disabled tasks count as
//! visible: disabled tasks are ordered like any other (they can anchor
//! edges) and only excluded from execution by the scheduler.

use std::collections::{BTreeSet, VecDeque};

use thiserror::Error;
use tracing::{debug, trace};

use crate::graph::{CycleError, Graph};
use crate::task::{Relation, RelationKind, TaskId, TaskTree};

#[derive(Debug, Error)]
pub enum ResolveError {
  /// One or more non-conditional relations had no matching provider or
  /// target anywhere in the tree.
  #[error("{}", describe_unresolved(.relations))]
  Unresolved { relations: Vec<Relation> },

  #[error(transparent)]
  Cycle(#[from] CycleError<TaskId>),
}

fn describe_unresolved(relations: &[Relation]) -> String {
  let mut out = format!("{} unresolved relationship(s):", relations.len());
  for relation in relations {
    out.push_str("\n  ");
    out.push_str(&relation.to_string());
  }
  out
}

/// Capability tags and task ids visible anywhere in the task set.
struct Visibility {
  caps: BTreeSet<String>,
  ids: BTreeSet<String>,
}

fn visibility(tree: &TaskTree) -> Visibility {
  let mut caps = BTreeSet::new();
  let mut ids = BTreeSet::new();

  for task in tree.tasks() {
    caps.extend(task.spec().provides.iter().cloned());
    ids.insert(task.id().0.clone());
  }

  Visibility { caps, ids }
}

/// Capabilities and ids inherited from enclosing scopes.
///
/// A relation whose target only exists in the background is satisfied
/// without an edge: ancestors always precede their subtree.
#[derive(Debug, Clone, Default)]
struct Background {
  caps: BTreeSet<String>,
  ids: BTreeSet<String>,
}

/// One scope member: a task plus everything attributed from its subtree.
struct Member {
  id: TaskId,
  /// The member and its resolved subtree, in execution order.
  order: Vec<TaskId>,
  provides: BTreeSet<String>,
  ids: BTreeSet<String>,
}

#[derive(Default)]
struct ScopeOutcome {
  order: Vec<TaskId>,
  residual: Vec<Relation>,
  provides: BTreeSet<String>,
  ids: BTreeSet<String>,
}

/// Resolve the whole tree into a total execution order.
pub fn resolve(tree: &TaskTree) -> Result<Vec<TaskId>, ResolveError> {
  let visible = visibility(tree);
  let outcome = resolve_scope(tree, tree.roots(), &Background::default(), &visible)?;

  if !outcome.residual.is_empty() {
    return Err(ResolveError::Unresolved {
      relations: outcome.residual,
    });
  }

  debug!(tasks = outcome.order.len(), "resolved execution order");
  Ok(outcome.order)
}

fn resolve_scope(
  tree: &TaskTree,
  members: &[TaskId],
  background: &Background,
  visible: &Visibility,
) -> Result<ScopeOutcome, ResolveError> {
  let mut infos: Vec<Member> = Vec::new();
  let mut pending: VecDeque<Relation> = VecDeque::new();

  for id in members {
    let task = tree.get(id).expect("scope member is registered");
    let spec = task.spec();

    // Children see this task's provides/id as implicit background.
    let mut child_background = background.clone();
    child_background.caps.extend(spec.provides.iter().cloned());
    child_background.ids.insert(spec.id.0.clone());

    let children = tree.children(id);
    let child = if children.is_empty() {
      ScopeOutcome::default()
    } else {
      resolve_scope(tree, children, &child_background, visible)?
    };

    for target in &spec.requires {
      pending.push_back(Relation {
        source: id.clone(),
        target: target.clone(),
        kind: RelationKind::Requires,
      });
    }
    for target in &spec.comes_before {
      pending.push_back(Relation {
        source: id.clone(),
        target: target.clone(),
        kind: RelationKind::ComesBefore,
      });
    }
    for target in &spec.comes_after {
      pending.push_back(Relation {
        source: id.clone(),
        target: target.clone(),
        kind: RelationKind::ComesAfter,
      });
    }

    for target in &spec.conditional_requires {
      if visible.caps.contains(target) {
        pending.push_back(Relation {
          source: id.clone(),
          target: target.clone(),
          kind: RelationKind::Requires,
        });
      } else {
        trace!(task = %id, target = %target, "dropping conditional requirement; no provider in task set");
      }
    }
    for target in &spec.conditional_comes_before {
      if visible.caps.contains(target) || visible.ids.contains(target) {
        pending.push_back(Relation {
          source: id.clone(),
          target: target.clone(),
          kind: RelationKind::ComesBefore,
        });
      } else {
        trace!(task = %id, target = %target, "dropping conditional ordering; target not in task set");
      }
    }
    for target in &spec.conditional_comes_after {
      if visible.caps.contains(target) || visible.ids.contains(target) {
        pending.push_back(Relation {
          source: id.clone(),
          target: target.clone(),
          kind: RelationKind::ComesAfter,
        });
      } else {
        trace!(task = %id, target = %target, "dropping conditional ordering; target not in task set");
      }
    }

    // Whatever the child scope could not match is retried here.
    pending.extend(child.residual);

    let mut provides = spec.provides.clone();
    provides.extend(child.provides);
    let mut ids = BTreeSet::from([spec.id.0.clone()]);
    ids.extend(child.ids);
    let mut order = vec![spec.id.clone()];
    order.extend(child.order);

    infos.push(Member {
      id: id.clone(),
      order,
      provides,
      ids,
    });
  }

  let mut graph = Graph::new();
  for info in &infos {
    graph.add_node(info.id.clone());
  }

  // Drain the pending queue in passes. Unmatched relations are re-queued;
  // once a full pass makes no progress the leftovers are this scope's
  // residual.
  let mut residual: Vec<Relation> = Vec::new();
  loop {
    let mut progressed = false;
    let mut deferred: VecDeque<Relation> = VecDeque::new();

    while let Some(relation) = pending.pop_front() {
      if match_relation(&relation, &infos, background, &mut graph) {
        progressed = true;
      } else {
        deferred.push_back(relation);
      }
    }

    if deferred.is_empty() {
      break;
    }
    if !progressed {
      residual = deferred.into_iter().collect();
      break;
    }
    pending = deferred;
  }

  let member_order = graph.topological_sort()?;

  let mut order = Vec::new();
  for member_id in member_order {
    let info = infos
      .iter()
      .find(|info| info.id == member_id)
      .expect("sorted node is a scope member");
    order.extend(info.order.iter().cloned());
  }

  let mut provides = BTreeSet::new();
  let mut ids = BTreeSet::new();
  for info in infos {
    provides.extend(info.provides);
    ids.extend(info.ids);
  }

  Ok(ScopeOutcome {
    order,
    residual,
    provides,
    ids,
  })
}

/// Try to match one relation inside this scope.
///
/// Returns false when neither a member nor the background can satisfy
/// the target; such relations bubble up as residuals.
fn match_relation(relation: &Relation, infos: &[Member], background: &Background, graph: &mut Graph<TaskId>) -> bool {
  // Re-anchor deep sources to their representative member in this scope.
  let Some(source) = infos.iter().find(|info| info.ids.contains(&relation.source.0)) else {
    return false;
  };

  match relation.kind {
    RelationKind::Requires => {
      let providers: Vec<&Member> = infos.iter().filter(|info| info.provides.contains(&relation.target)).collect();

      if !providers.is_empty() {
        for provider in providers {
          // A task requiring its own capability is self-referential.
          if provider.id != source.id {
            graph.add_edge(&provider.id, &source.id);
          }
        }
        return true;
      }

      background.caps.contains(&relation.target)
    }
    RelationKind::ComesBefore | RelationKind::ComesAfter => {
      let anchors = anchor_members(&relation.target, infos);

      if !anchors.is_empty() {
        for anchor in anchors {
          if anchor.id == source.id {
            continue;
          }
          match relation.kind {
            RelationKind::ComesBefore => graph.add_edge(&source.id, &anchor.id),
            RelationKind::ComesAfter => graph.add_edge(&anchor.id, &source.id),
            RelationKind::Requires => unreachable!("handled above"),
          }
        }
        return true;
      }

      background.caps.contains(&relation.target) || background.ids.contains(&relation.target)
    }
  }
}

/// Members an ordering relation anchors to: capability providers first,
/// then tasks matched by id.
fn anchor_members<'a>(target: &str, infos: &'a [Member]) -> Vec<&'a Member> {
  let providers: Vec<&Member> = infos.iter().filter(|info| info.provides.contains(target)).collect();
  if !providers.is_empty() {
    return providers;
  }

  infos.iter().filter(|info| info.ids.contains(target)).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::{NoopHooks, TaskSpec};

  fn register(tree: &mut TaskTree, spec: TaskSpec) {
    tree.register(spec, Box::new(NoopHooks)).unwrap();
  }

  fn position(order: &[TaskId], id: &str) -> usize {
    order.iter().position(|t| t.0 == id).unwrap()
  }

  #[test]
  fn provider_precedes_requirer() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("repos").provides("repos"));
    register(&mut tree, TaskSpec::new("packages").requires("repos"));

    let order = resolve(&tree).unwrap();
    assert!(position(&order, "repos") < position(&order, "packages"));
  }

  #[test]
  fn comes_before_and_after_by_id() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("image"));
    register(&mut tree, TaskSpec::new("cleanup").comes_after("image"));
    register(&mut tree, TaskSpec::new("prepare").comes_before("image"));

    let order = resolve(&tree).unwrap();
    assert!(position(&order, "prepare") < position(&order, "image"));
    assert!(position(&order, "image") < position(&order, "cleanup"));
  }

  #[test]
  fn unresolved_requirement_reports_all_relations() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("packages").requires("repos").requires("keys"));

    let err = resolve(&tree).unwrap_err();
    match err {
      ResolveError::Unresolved { relations } => {
        assert_eq!(relations.len(), 2);
        assert!(relations.iter().all(|r| r.source == TaskId::from("packages")));
      }
      other => panic!("expected unresolved error, got {:?}", other),
    }
  }

  #[test]
  fn requirement_cycle_is_enumerated() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("a").provides("cap-a").requires("cap-b"));
    register(&mut tree, TaskSpec::new("b").provides("cap-b").requires("cap-c"));
    register(&mut tree, TaskSpec::new("c").provides("cap-c").requires("cap-a"));

    let err = resolve(&tree).unwrap_err();
    match err {
      ResolveError::Cycle(cycle) => {
        assert_eq!(cycle.cycles.len(), 1);
        assert_eq!(cycle.cycles[0].len(), 3);
      }
      other => panic!("expected cycle error, got {:?}", other),
    }
  }

  #[test]
  fn conditional_requirement_without_provider_is_dropped() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("a").provides("p"));
    register(&mut tree, TaskSpec::new("b").requires("p"));
    register(&mut tree, TaskSpec::new("c").conditionally_requires("q"));

    let order = resolve(&tree).unwrap();
    assert_eq!(order.len(), 3);
    assert!(position(&order, "a") < position(&order, "b"));
    // "c" resolves with no constraints at all.
    assert!(order.contains(&TaskId::from("c")));
  }

  #[test]
  fn conditional_requirement_with_provider_is_kept() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("signing").provides("signing-keys"));
    register(&mut tree, TaskSpec::new("rpms").conditionally_requires("signing-keys"));

    let order = resolve(&tree).unwrap();
    assert!(position(&order, "signing") < position(&order, "rpms"));
  }

  #[test]
  fn disabled_provider_still_counts_as_visible() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("ghost").provides("p"));
    register(&mut tree, TaskSpec::new("b").conditionally_requires("p"));
    tree.disable(&TaskId::from("ghost")).unwrap();

    // The conditional target exists (in a disabled task), so the
    // relation is kept and the disabled provider still anchors the edge.
    let order = resolve(&tree).unwrap();
    assert!(position(&order, "ghost") < position(&order, "b"));
  }

  #[test]
  fn own_capability_requirement_is_ignored() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("solo").provides("cap").requires("cap"));

    let order = resolve(&tree).unwrap();
    assert_eq!(order, vec![TaskId::from("solo")]);
  }

  #[test]
  fn child_requirement_satisfied_by_aunt() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("repos").provides("repos"));
    register(&mut tree, TaskSpec::new("stage").meta());
    register(&mut tree, TaskSpec::new("packages").parent("stage").requires("repos"));

    let order = resolve(&tree).unwrap();
    assert!(position(&order, "repos") < position(&order, "stage"));
    assert!(position(&order, "stage") < position(&order, "packages"));
  }

  #[test]
  fn child_capabilities_are_attributed_to_parent() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("stage").meta());
    register(&mut tree, TaskSpec::new("unpack").parent("stage").provides("base-tree"));
    register(&mut tree, TaskSpec::new("iso").requires("base-tree"));

    let order = resolve(&tree).unwrap();
    assert!(position(&order, "stage") < position(&order, "iso"));
    assert!(position(&order, "unpack") < position(&order, "iso"));
  }

  #[test]
  fn parent_background_satisfies_child_without_edge() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("stage").provides("workdir"));
    register(&mut tree, TaskSpec::new("populate").parent("stage").requires("workdir"));

    // Parent precedes its children by construction; no edge needed.
    let order = resolve(&tree).unwrap();
    assert_eq!(order, vec![TaskId::from("stage"), TaskId::from("populate")]);
  }

  #[test]
  fn children_are_spliced_at_parent_position() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("early"));
    register(&mut tree, TaskSpec::new("group").comes_after("early"));
    register(&mut tree, TaskSpec::new("inner-a").parent("group"));
    register(&mut tree, TaskSpec::new("inner-b").parent("group").comes_after("inner-a"));
    register(&mut tree, TaskSpec::new("late").comes_after("group"));

    let order = resolve(&tree).unwrap();
    assert_eq!(
      order,
      vec![
        TaskId::from("early"),
        TaskId::from("group"),
        TaskId::from("inner-a"),
        TaskId::from("inner-b"),
        TaskId::from("late"),
      ]
    );
  }

  #[test]
  fn resolution_is_idempotent() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("a").provides("p"));
    register(&mut tree, TaskSpec::new("b").requires("p"));
    register(&mut tree, TaskSpec::new("c").comes_after("a"));

    let first = resolve(&tree).unwrap();
    let second = resolve(&tree).unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn duplicate_relations_are_idempotent() {
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("a").provides("p"));
    // Both a requirement and an explicit ordering toward the same target.
    register(&mut tree, TaskSpec::new("b").requires("p").comes_after("p"));

    let order = resolve(&tree).unwrap();
    assert!(position(&order, "a") < position(&order, "b"));
  }

  #[test]
  fn end_to_end_scenario_from_three_tasks() {
    // Tasks {A provides "p", B requires "p", C conditionally requires
    // "q"} with no provider of "q": resolves with A before B, C
    // unconstrained.
    let mut tree = TaskTree::new();
    register(&mut tree, TaskSpec::new("A").provides("p"));
    register(&mut tree, TaskSpec::new("B").requires("p"));
    register(&mut tree, TaskSpec::new("C").conditionally_requires("q"));

    let order = resolve(&tree).unwrap();
    assert_eq!(order.len(), 3);
    assert!(position(&order, "A") < position(&order, "B"));
  }
}
