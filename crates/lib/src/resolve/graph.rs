//! The Build Graph: selected formulas and their ordering edges.

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

/// Directed graph over catalog declaration indices.
///
/// Edges run from dependency to dependent. Node weights are declaration
/// indices, which are also the tie-break for every ordering decision.
#[derive(Debug, Clone, Default)]
pub struct BuildGraph {
  graph: DiGraph<usize, ()>,
  nodes: HashMap<usize, NodeIndex>,
}

impl BuildGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a node for a declaration index (no-op if present).
  pub fn add_node(&mut self, index: usize) -> NodeIndex {
    if let Some(&node) = self.nodes.get(&index) {
      return node;
    }
    let node = self.graph.add_node(index);
    self.nodes.insert(index, node);
    node
  }

  /// Add an ordering edge: `dependency` must be built before `dependent`.
  pub fn add_edge(&mut self, dependency: usize, dependent: usize) {
    let from = self.add_node(dependency);
    let to = self.add_node(dependent);
    self.graph.update_edge(from, to, ());
  }

  pub fn contains(&self, index: usize) -> bool {
    self.nodes.contains_key(&index)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Direct ordering dependencies of `index`, by declaration index.
  pub fn dependencies(&self, index: usize) -> BTreeSet<usize> {
    self.neighbors(index, Direction::Incoming)
  }

  /// Direct dependents of `index`, by declaration index.
  pub fn dependents(&self, index: usize) -> BTreeSet<usize> {
    self.neighbors(index, Direction::Outgoing)
  }

  fn neighbors(&self, index: usize, direction: Direction) -> BTreeSet<usize> {
    let Some(&node) = self.nodes.get(&index) else {
      return BTreeSet::new();
    };
    self
      .graph
      .neighbors_directed(node, direction)
      .map(|n| self.graph[n])
      .collect()
  }

  /// Every package `index` transitively depends on (excluding itself).
  pub fn ancestors(&self, index: usize) -> BTreeSet<usize> {
    let Some(&start) = self.nodes.get(&index) else {
      return BTreeSet::new();
    };
    let reversed = Reversed(&self.graph);
    let mut dfs = Dfs::new(reversed, start);
    let mut found = BTreeSet::new();
    while let Some(node) = dfs.next(reversed) {
      if node != start {
        found.insert(self.graph[node]);
      }
    }
    found
  }

  /// Every package that transitively depends on `index` (excluding itself).
  pub fn descendants(&self, index: usize) -> BTreeSet<usize> {
    let Some(&start) = self.nodes.get(&index) else {
      return BTreeSet::new();
    };
    let mut dfs = Dfs::new(&self.graph, start);
    let mut found = BTreeSet::new();
    while let Some(node) = dfs.next(&self.graph) {
      if node != start {
        found.insert(self.graph[node]);
      }
    }
    found
  }

  /// Kahn's algorithm with the ready set ordered by declaration index.
  ///
  /// On a cycle, returns the members of every cyclic strongly connected
  /// component, by declaration index.
  pub fn topological_order(&self) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
      .collect();

    let mut ready: BTreeSet<usize> = self
      .graph
      .node_indices()
      .filter(|n| in_degree[n] == 0)
      .map(|n| self.graph[n])
      .collect();

    let mut order = Vec::with_capacity(self.len());
    while let Some(index) = ready.pop_first() {
      order.push(index);
      let node = self.nodes[&index];
      for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
        if let Some(degree) = in_degree.get_mut(&dependent) {
          *degree -= 1;
          if *degree == 0 {
            ready.insert(self.graph[dependent]);
          }
        }
      }
    }

    if order.len() == self.len() {
      Ok(order)
    } else {
      Err(self.cycle_members())
    }
  }

  fn cycle_members(&self) -> Vec<usize> {
    let mut members = BTreeSet::new();
    for component in tarjan_scc(&self.graph) {
      let cyclic = component.len() > 1 || component.iter().any(|&n| self.graph.contains_edge(n, n));
      if cyclic {
        members.extend(component.iter().map(|&n| self.graph[n]));
      }
    }
    members.into_iter().collect()
  }

  /// Group `order` into waves: each package lands one wave after its
  /// deepest dependency. Within a wave, packages keep their order.
  pub fn waves(&self, order: &[usize]) -> Vec<Vec<usize>> {
    let mut level: HashMap<usize, usize> = HashMap::new();
    let mut waves: Vec<Vec<usize>> = Vec::new();

    for &index in order {
      let wave = self
        .dependencies(index)
        .iter()
        .filter_map(|dep| level.get(dep))
        .map(|l| l + 1)
        .max()
        .unwrap_or(0);
      level.insert(index, wave);
      if waves.len() <= wave {
        waves.resize_with(wave + 1, Vec::new);
      }
      waves[wave].push(index);
    }

    waves
  }
}
