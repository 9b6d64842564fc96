//! Dependency resolution: record selection, Build Graph and build order.
//!
//! Resolution happens once per run, before anything is fetched or built.
//! Every configuration error (unknown names, conflicting version pins,
//! cycles) is reported here, so a failing resolution never runs a step.
//!
//! # Ordering edges
//!
//! A package P is ordered after:
//! - each build dependency D of P,
//! - each optional dependency of P that is in the closure for another reason,
//! - the runtime dependencies (transitively) of each such D.
//!
//! Runtime dependencies of P itself are included in the closure but are not
//! ordered before P.

mod graph;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info};

pub use graph::BuildGraph;

use crate::formula::{Catalog, DependencyKind, FormulaDef};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  #[error("dependency cycle detected among: {}", .members.join(", "))]
  CycleDetected { members: Vec<String> },

  #[error("{dependent} depends on unknown formula '{name}'")]
  UnknownDependency { dependent: String, name: String },

  #[error("unknown formula '{name}'")]
  UnknownPackage { name: String },

  #[error("ambiguous version for '{name}': {reason}")]
  AmbiguousVersion { name: String, reason: String },
}

/// A requested top-level package, `name` or `name@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
  pub name: String,
  pub version: Option<String>,
}

impl Request {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      version: None,
    }
  }

  pub fn pinned(name: &str, version: &str) -> Self {
    Self {
      name: name.to_string(),
      version: Some(version.to_string()),
    }
  }
}

impl FromStr for Request {
  type Err = ResolveError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.split_once('@') {
      Some((name, version)) if !name.is_empty() && !version.is_empty() => Ok(Self::pinned(name, version)),
      Some(_) => Err(ResolveError::UnknownPackage { name: s.to_string() }),
      None => Ok(Self::new(s)),
    }
  }
}

impl fmt::Display for Request {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.version {
      Some(version) => write!(f, "{}@{}", self.name, version),
      None => write!(f, "{}", self.name),
    }
  }
}

/// The outcome of resolving a request set against a catalog.
///
/// All indices are catalog declaration indices.
#[derive(Debug, Clone)]
pub struct Resolution {
  requested: Vec<usize>,
  order: Vec<usize>,
  position: HashMap<usize, usize>,
  graph: BuildGraph,
}

impl Resolution {
  /// Requested packages, in request order.
  pub fn requested(&self) -> &[usize] {
    &self.requested
  }

  /// Build order: every package after all of its ordering dependencies.
  pub fn order(&self) -> &[usize] {
    &self.order
  }

  pub fn graph(&self) -> &BuildGraph {
    &self.graph
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  pub fn contains(&self, index: usize) -> bool {
    self.position.contains_key(&index)
  }

  /// Position of `index` in the build order.
  pub fn position(&self, index: usize) -> Option<usize> {
    self.position.get(&index).copied()
  }

  /// Direct ordering dependencies, in build order.
  pub fn dependencies(&self, index: usize) -> Vec<usize> {
    self.in_order(self.graph.dependencies(index))
  }

  /// Transitive ordering dependencies, in build order.
  pub fn closure(&self, index: usize) -> Vec<usize> {
    self.in_order(self.graph.ancestors(index))
  }

  /// Every package that transitively depends on `index`, in build order.
  pub fn dependents_closure(&self, index: usize) -> Vec<usize> {
    self.in_order(self.graph.descendants(index))
  }

  /// Parallel waves over the build order.
  pub fn waves(&self) -> Vec<Vec<usize>> {
    self.graph.waves(&self.order)
  }

  fn in_order(&self, set: BTreeSet<usize>) -> Vec<usize> {
    let mut items: Vec<usize> = set.into_iter().collect();
    items.sort_by_key(|i| self.position.get(i).copied().unwrap_or(usize::MAX));
    items
  }
}

/// Resolve `requests` against `catalog`.
pub fn resolve(catalog: &Catalog, requests: &[Request]) -> Result<Resolution, ResolveError> {
  let selected = select(catalog, requests)?;

  let requested: Vec<usize> = requests
    .iter()
    .filter_map(|r| selected.get(&r.name).copied())
    .fold(Vec::new(), |mut acc, i| {
      if !acc.contains(&i) {
        acc.push(i);
      }
      acc
    });

  let graph = build_graph(catalog, &selected);
  let order = graph.topological_order().map_err(|members| ResolveError::CycleDetected {
    members: members.iter().map(|&i| label(catalog, i)).collect(),
  })?;
  let position = order.iter().enumerate().map(|(pos, &i)| (i, pos)).collect();

  info!(requested = requests.len(), packages = order.len(), "resolved build order");
  Ok(Resolution {
    requested,
    order,
    position,
    graph,
  })
}

fn label(catalog: &Catalog, index: usize) -> String {
  catalog.get(index).map(FormulaDef::label).unwrap_or_default()
}

/// Where a name was asked for, used to pick the error variant.
#[derive(Clone)]
enum Origin {
  Request,
  Dependency(String),
}

impl Origin {
  fn unknown(&self, name: String) -> ResolveError {
    match self {
      Origin::Request => ResolveError::UnknownPackage { name },
      Origin::Dependency(dependent) => ResolveError::UnknownDependency {
        dependent: dependent.clone(),
        name,
      },
    }
  }
}

/// Select one record per name reachable through build and runtime
/// dependencies, iterating until no new pin changes the selection.
fn select(catalog: &Catalog, requests: &[Request]) -> Result<BTreeMap<String, usize>, ResolveError> {
  let mut selected: BTreeMap<String, usize> = BTreeMap::new();
  let mut pins: HashMap<String, String> = HashMap::new();

  loop {
    let mut progressed = false;
    let mut deferred: Vec<String> = Vec::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<(String, Option<String>, Origin)> = requests
      .iter()
      .map(|r| (r.name.clone(), r.version.clone(), Origin::Request))
      .collect();

    while let Some((name, pin, origin)) = queue.pop_front() {
      if let Some(version) = pin {
        match pins.get(&name) {
          Some(existing) if *existing != version => {
            return Err(ResolveError::AmbiguousVersion {
              name,
              reason: format!("pinned to both {existing} and {version}"),
            });
          }
          Some(_) => {}
          None => {
            pins.insert(name.clone(), version);
            progressed = true;
          }
        }
      }

      if !visited.insert(name.clone()) {
        continue;
      }

      let index = match selected.get(&name) {
        Some(&index) => index,
        None => {
          let candidates = catalog.candidates(&name);
          let choice = match (pins.get(&name), candidates.len()) {
            (_, 0) => return Err(origin.unknown(name)),
            (Some(version), _) => catalog
              .find(&name, version)
              .ok_or_else(|| origin.unknown(format!("{name}@{version}")))?,
            (None, 1) => candidates[0],
            (None, _) => {
              deferred.push(name);
              continue;
            }
          };
          debug!(formula = %label(catalog, choice), "selected record");
          selected.insert(name.clone(), choice);
          progressed = true;
          choice
        }
      };

      let formula = &catalog.formulas()[index];
      for dep in &formula.dependencies {
        if dep.kind != DependencyKind::Optional {
          queue.push_back((dep.name.clone(), dep.version.clone(), Origin::Dependency(formula.label())));
        }
      }
    }

    // A pin discovered late may not match a record chosen before it
    for (name, version) in &pins {
      if let Some(&index) = selected.get(name)
        && catalog.formulas()[index].version != *version
      {
        return Err(ResolveError::AmbiguousVersion {
          name: name.clone(),
          reason: format!(
            "pinned to {version} but {} was already selected",
            catalog.formulas()[index].version
          ),
        });
      }
    }

    if deferred.is_empty() {
      return Ok(selected);
    }
    if !progressed {
      let name = deferred.swap_remove(0);
      let versions: Vec<&str> = catalog
        .candidates(&name)
        .iter()
        .map(|&i| catalog.formulas()[i].version.as_str())
        .collect();
      return Err(ResolveError::AmbiguousVersion {
        reason: format!("no pin selects one of {}", versions.join(", ")),
        name,
      });
    }
  }
}

fn build_graph(catalog: &Catalog, selected: &BTreeMap<String, usize>) -> BuildGraph {
  let mut graph = BuildGraph::new();
  let formulas = catalog.formulas();

  for &index in selected.values() {
    graph.add_node(index);
  }

  for &index in selected.values() {
    for dep in &formulas[index].dependencies {
      if dep.kind == DependencyKind::Runtime {
        continue;
      }
      // Inactive optional dependencies are not in the selection
      let Some(&dep_index) = selected.get(&dep.name) else {
        continue;
      };
      graph.add_edge(dep_index, index);
      for runtime in runtime_closure(catalog, selected, dep_index) {
        graph.add_edge(runtime, index);
      }
    }
  }

  graph
}

/// Runtime dependencies of `index`, followed transitively through runtime edges.
fn runtime_closure(catalog: &Catalog, selected: &BTreeMap<String, usize>, index: usize) -> BTreeSet<usize> {
  let mut found = BTreeSet::new();
  let mut stack = vec![index];
  while let Some(current) = stack.pop() {
    for dep in catalog.formulas()[current].dependencies_of(DependencyKind::Runtime) {
      if let Some(&dep_index) = selected.get(&dep.name)
        && found.insert(dep_index)
      {
        stack.push(dep_index);
      }
    }
  }
  found
}
