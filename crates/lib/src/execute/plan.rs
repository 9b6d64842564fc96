//! Build plans: the resolved order with everything a run needs per package.
//!
//! A plan is computed once, before any build starts, and shared read-only
//! with every build task.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use tracing::{debug, warn};

use super::steps;
use super::types::{BuildError, ExecuteError};
use crate::env::{self, CompositionContext, Contribution, Environment, EnvironmentCompositionError};
use crate::formula::{Catalog, FormulaDef, OptionOverrides};
use crate::placeholder::Scope;
use crate::resolve::{self, Request, Resolution};
use crate::store::{ArtifactStore, InstallKey};
use crate::util::hash::Fingerprint;

/// One package of a plan.
#[derive(Debug, Clone)]
pub struct PackagePlan {
  /// Catalog declaration index.
  pub index: usize,
  pub formula: FormulaDef,
  /// Effective option values.
  pub options: BTreeMap<String, bool>,
  pub fingerprint: Fingerprint,
  pub key: InstallKey,
  pub install_path: PathBuf,
}

impl PackagePlan {
  pub fn label(&self) -> String {
    self.formula.label()
  }

  fn install_path_str(&self) -> String {
    self.install_path.to_string_lossy().into_owned()
  }
}

/// The packages of a run in build order. Positions index `packages()`.
#[derive(Debug, Clone)]
pub struct BuildPlan {
  resolution: Resolution,
  packages: Vec<PackagePlan>,
  positions: HashMap<usize, usize>,
}

impl BuildPlan {
  /// Resolve `requests` and fingerprint every package in build order.
  pub fn new<S: ArtifactStore + ?Sized>(
    catalog: &Catalog,
    requests: &[Request],
    overrides: &OptionOverrides,
    store: &S,
  ) -> Result<Self, ExecuteError> {
    let resolution = resolve::resolve(catalog, requests)?;
    let mut packages: Vec<PackagePlan> = Vec::with_capacity(resolution.len());
    let mut positions = HashMap::new();

    for &index in resolution.order() {
      let formula = &catalog.formulas()[index];
      for (option, _) in overrides.for_formula(&formula.name) {
        if !formula.options.contains_key(option) {
          warn!(formula = %formula.name, option = %option, "ignoring override of undeclared option");
        }
      }

      let options = formula.effective_options(overrides);
      let dependencies: Vec<&Fingerprint> = resolution
        .dependencies(index)
        .iter()
        .filter_map(|dep| positions.get(dep).map(|&pos: &usize| &packages[pos].fingerprint))
        .collect();
      let fingerprint = formula
        .fingerprint(&options, &dependencies)
        .map_err(|e| ExecuteError::Fingerprint {
          name: formula.label(),
          message: e.to_string(),
        })?;

      let key = InstallKey::new(&formula.name, &formula.version, fingerprint.clone());
      let install_path = store.install_path(&key);
      debug!(formula = %formula.label(), fingerprint = %fingerprint, "planned package");

      positions.insert(index, packages.len());
      packages.push(PackagePlan {
        index,
        formula: formula.clone(),
        options,
        fingerprint,
        key,
        install_path,
      });
    }

    Ok(Self {
      resolution,
      packages,
      positions,
    })
  }

  pub fn resolution(&self) -> &Resolution {
    &self.resolution
  }

  /// Packages in build order.
  pub fn packages(&self) -> &[PackagePlan] {
    &self.packages
  }

  pub fn package(&self, position: usize) -> &PackagePlan {
    &self.packages[position]
  }

  pub fn len(&self) -> usize {
    self.packages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.packages.is_empty()
  }

  /// Position of the package named `name`.
  pub fn position_of(&self, name: &str) -> Option<usize> {
    self.packages.iter().position(|p| p.formula.name == name)
  }

  /// Requested packages, as positions.
  pub fn requested(&self) -> Vec<usize> {
    self.to_positions(self.resolution.requested())
  }

  /// Direct ordering dependencies of the package at `position`.
  pub fn dependencies(&self, position: usize) -> Vec<usize> {
    self.to_positions(&self.resolution.dependencies(self.packages[position].index))
  }

  /// Transitive ordering dependencies of the package at `position`.
  pub fn closure(&self, position: usize) -> Vec<usize> {
    self.to_positions(&self.resolution.closure(self.packages[position].index))
  }

  /// Every package transitively depending on the one at `position`.
  pub fn dependents_closure(&self, position: usize) -> Vec<usize> {
    self.to_positions(&self.resolution.dependents_closure(self.packages[position].index))
  }

  /// Parallel waves, as positions.
  pub fn waves(&self) -> Vec<Vec<usize>> {
    self
      .resolution
      .waves()
      .iter()
      .map(|wave| self.to_positions(wave))
      .collect()
  }

  /// `$${dep:NAME}` values for the package at `position`: its ordering
  /// closure plus any other declared dependency in the run.
  pub fn dependency_paths(&self, position: usize) -> BTreeMap<String, String> {
    let mut paths: BTreeMap<String, String> = self
      .closure(position)
      .into_iter()
      .map(|pos| {
        let package = &self.packages[pos];
        (package.formula.name.clone(), package.install_path_str())
      })
      .collect();

    for dep in &self.packages[position].formula.dependencies {
      if let Some(pos) = self.position_of(&dep.name) {
        paths
          .entry(dep.name.clone())
          .or_insert_with(|| self.packages[pos].install_path_str());
      }
    }
    paths
  }

  /// `$${jobs}` for the package at `position`.
  pub fn jobs_for(&self, position: usize, make_jobs: usize) -> String {
    if self.packages[position].formula.deparallelize {
      "1".to_string()
    } else {
      make_jobs.max(1).to_string()
    }
  }

  /// Compose the build environment of the package at `position`: `base`,
  /// then the exports of its closure in build order, then its own `env`.
  pub fn compose_environment(
    &self,
    position: usize,
    base: &Environment,
    make_jobs: usize,
  ) -> Result<Environment, EnvironmentCompositionError> {
    let closure = self.closure(position);
    let prefixes: Vec<String> = closure.iter().map(|&pos| self.packages[pos].install_path_str()).collect();
    let exports: Vec<Contribution<'_>> = closure
      .iter()
      .zip(&prefixes)
      .map(|(&pos, prefix)| {
        let package = &self.packages[pos];
        Contribution {
          package: &package.formula.name,
          prefix,
          options: &package.options,
          ops: &package.formula.exports,
        }
      })
      .collect();

    let package = &self.packages[position];
    let prefix = package.install_path_str();
    let own = Contribution {
      package: &package.formula.name,
      prefix: &prefix,
      options: &package.options,
      ops: &package.formula.env,
    };

    let dependencies = self.dependency_paths(position);
    let jobs = self.jobs_for(position, make_jobs);
    env::compose(base, &exports, &own, &CompositionContext::new(&dependencies, &jobs))
  }

  /// Render the steps of the package at `position` for display, with
  /// `<src>` and `<work>` standing in for the directories of a real build.
  pub fn render_steps(
    &self,
    position: usize,
    env: &Environment,
    make_jobs: usize,
    shell: Option<&str>,
  ) -> Result<Vec<String>, BuildError> {
    let package = &self.packages[position];
    let prefix = package.install_path_str();
    let dependencies = self.dependency_paths(position);
    let jobs = self.jobs_for(position, make_jobs);
    let resources: BTreeMap<String, String> = package
      .formula
      .resources
      .iter()
      .map(|r| (r.name.clone(), format!("<work>/resources/{}", r.name)))
      .collect();

    let scope = Scope {
      prefix: Some(&prefix),
      src: Some("<src>"),
      work: Some("<work>"),
      jobs: Some(&jobs),
      dependencies: Some(&dependencies),
      options: Some(&package.options),
      env: Some(env.as_map()),
      resources: Some(&resources),
    };

    package
      .formula
      .steps
      .iter()
      .enumerate()
      .map(|(i, step)| steps::render(step, i + 1, &scope, shell).map(|inv| inv.command_line()))
      .collect()
  }

  fn to_positions(&self, indices: &[usize]) -> Vec<usize> {
    indices.iter().filter_map(|i| self.positions.get(i).copied()).collect()
  }
}
