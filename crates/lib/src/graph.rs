//! Generic ordering graph for build scheduling.
//!
//! This module provides the directed graph underlying dependency
//! resolution: nodes are inserted once, edges mean "source runs before
//! target", and `topological_sort` produces a total order or enumerates
//! every dependency cycle it finds. The resolver never guesses which edge
//! of a cycle to drop; the full cycle list is surfaced to the caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Display};
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

/// One or more dependency cycles found during topological sorting.
///
/// Each cycle is reported as an ordered edge list, canonicalized to start
/// at its smallest node so the same cycle is never reported twice.
#[derive(Debug, Error)]
#[error("{}", self.describe())]
pub struct CycleError<N: Display + Debug> {
  pub cycles: Vec<Vec<(N, N)>>,
}

impl<N: Display + Debug> CycleError<N> {
  fn describe(&self) -> String {
    let mut out = format!("{} dependency cycle(s) detected:", self.cycles.len());
    for cycle in &self.cycles {
      out.push_str("\n  ");
      let edges: Vec<String> = cycle.iter().map(|(a, b)| format!("{} -> {}", a, b)).collect();
      out.push_str(&edges.join(", "));
    }
    out
  }
}

/// A directed "runs before" graph over arbitrary node values.
///
/// Duplicate nodes and duplicate edges are idempotent, so callers can feed
/// relationship records in without deduplicating first.
pub struct Graph<N> {
  graph: DiGraph<N, ()>,
  nodes: HashMap<N, NodeIndex>,
}

impl<N> Default for Graph<N>
where
  N: Clone + Eq + Hash + Ord + Display + Debug,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<N> Graph<N>
where
  N: Clone + Eq + Hash + Ord + Display + Debug,
{
  pub fn new() -> Self {
    Self {
      graph: DiGraph::new(),
      nodes: HashMap::new(),
    }
  }

  /// Insert a node, returning its index. Inserting twice is a no-op.
  pub fn add_node(&mut self, value: N) -> NodeIndex {
    if let Some(&idx) = self.nodes.get(&value) {
      return idx;
    }
    let idx = self.graph.add_node(value.clone());
    self.nodes.insert(value, idx);
    idx
  }

  /// Add an edge meaning "`before` must run before `after`".
  ///
  /// Unknown endpoints are inserted on the fly.
  pub fn add_edge(&mut self, before: &N, after: &N) {
    let a = self.add_node(before.clone());
    let b = self.add_node(after.clone());
    if self.graph.find_edge(a, b).is_none() {
      self.graph.add_edge(a, b, ());
    }
  }

  pub fn contains(&self, value: &N) -> bool {
    self.nodes.contains_key(value)
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn edge_count(&self) -> usize {
    self.graph.edge_count()
  }

  /// Produce a total order via Kahn's algorithm.
  ///
  /// Nodes become ready when their last incoming edge is consumed; ready
  /// nodes are taken first-in-first-out, which makes the order
  /// deterministic in insertion order for unconstrained nodes.
  ///
  /// # Errors
  ///
  /// If no zero-in-degree node remains while nodes are still unprocessed,
  /// the graph has at least one cycle. A DFS is run from every unprocessed
  /// node and every path returning to its own start is recorded, so the
  /// error carries the complete cycle list.
  pub fn topological_sort(&self) -> Result<Vec<N>, CycleError<N>> {
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in self.graph.node_indices() {
      in_degree.insert(idx, self.graph.neighbors_directed(idx, Direction::Incoming).count());
    }

    let mut ready: VecDeque<NodeIndex> = self
      .graph
      .node_indices()
      .filter(|idx| in_degree[idx] == 0)
      .collect();

    let mut order = Vec::with_capacity(self.graph.node_count());

    while let Some(idx) = ready.pop_front() {
      order.push(self.graph[idx].clone());

      for succ in self.graph.neighbors_directed(idx, Direction::Outgoing) {
        let deg = in_degree.get_mut(&succ).expect("successor tracked in in-degree map");
        *deg -= 1;
        if *deg == 0 {
          ready.push_back(succ);
        }
      }
    }

    if order.len() == self.graph.node_count() {
      return Ok(order);
    }

    let remaining: HashSet<NodeIndex> = self
      .graph
      .node_indices()
      .filter(|idx| in_degree[idx] > 0)
      .collect();

    Err(CycleError {
      cycles: self.enumerate_cycles(&remaining),
    })
  }

  /// Enumerate cycles among the given unprocessed nodes.
  ///
  /// Runs a DFS from every node; a path that returns to its own start is a
  /// cycle. Cycles are rotated to begin at their smallest node and
  /// deduplicated, then returned as ordered edge lists.
  fn enumerate_cycles(&self, remaining: &HashSet<NodeIndex>) -> Vec<Vec<(N, N)>> {
    let mut starts: Vec<NodeIndex> = remaining.iter().copied().collect();
    starts.sort();

    let mut seen: HashSet<Vec<N>> = HashSet::new();
    let mut cycles = Vec::new();

    for start in starts {
      let Some(path) = self.find_cycle(start, remaining) else {
        continue;
      };

      let mut nodes: Vec<N> = path.into_iter().map(|idx| self.graph[idx].clone()).collect();
      let min_pos = nodes
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.cmp(b))
        .map(|(pos, _)| pos)
        .expect("cycle path is non-empty");
      nodes.rotate_left(min_pos);

      if !seen.insert(nodes.clone()) {
        continue;
      }

      let mut edges = Vec::with_capacity(nodes.len());
      for i in 0..nodes.len() {
        edges.push((nodes[i].clone(), nodes[(i + 1) % nodes.len()].clone()));
      }
      cycles.push(edges);
    }

    cycles
  }

  /// Find one path from `start` back to `start` within `remaining`.
  fn find_cycle(&self, start: NodeIndex, remaining: &HashSet<NodeIndex>) -> Option<Vec<NodeIndex>> {
    let mut path = vec![start];
    let mut visited = HashSet::from([start]);

    if self.walk_back_to(start, start, remaining, &mut path, &mut visited) {
      Some(path)
    } else {
      None
    }
  }

  fn walk_back_to(
    &self,
    current: NodeIndex,
    start: NodeIndex,
    remaining: &HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
    visited: &mut HashSet<NodeIndex>,
  ) -> bool {
    for succ in self.graph.neighbors_directed(current, Direction::Outgoing) {
      if succ == start {
        return true;
      }
      if !remaining.contains(&succ) || !visited.insert(succ) {
        continue;
      }

      path.push(succ);
      if self.walk_back_to(succ, start, remaining, path, visited) {
        return true;
      }
      path.pop();
    }

    false
  }
}
