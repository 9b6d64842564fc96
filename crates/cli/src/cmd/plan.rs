//! Implementation of the `keg plan` command.
//!
//! Resolves the requested formulas and prints the build order, parallel
//! waves, fingerprints, cache state and rendered step commands without
//! fetching or running anything.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use keg_lib::execute::{BuildPlan, default_base_env};
use keg_lib::store::{ArtifactStore, FsStore, LockMode};

use super::{OptionArgs, load_catalog, parse_requests};
use crate::output::{print_info, print_json, symbols};

#[derive(Args, Debug)]
pub struct PlanArgs {
  /// Formulas to plan, as NAME or NAME@VERSION
  #[arg(required = true)]
  names: Vec<String>,

  #[command(flatten)]
  options: OptionArgs,

  /// Make jobs per package used when rendering steps (default: number of CPUs)
  #[arg(long)]
  make_jobs: Option<usize>,

  /// Shell for shell steps
  #[arg(long)]
  shell: Option<String>,

  /// Output as JSON
  #[arg(long)]
  json: bool,
}

#[derive(Debug, Serialize)]
struct PlannedPackage {
  name: String,
  version: String,
  fingerprint: String,
  install_path: PathBuf,
  cached: bool,
  dependencies: Vec<String>,
  options: std::collections::BTreeMap<String, bool>,
  /// Rendered commands, or the error that prevents rendering them.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  steps: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
}

#[derive(Debug, Serialize)]
struct PlanOutput {
  requested: Vec<String>,
  packages: Vec<PlannedPackage>,
  waves: Vec<Vec<String>>,
}

pub fn cmd_plan(args: PlanArgs, catalog_path: &Path, store: &FsStore) -> Result<()> {
  let catalog = load_catalog(catalog_path)?;
  let requests = parse_requests(&args.names)?;
  let overrides = args.options.overrides()?;

  let _lock = store
    .lock(LockMode::Shared, "plan")
    .context("Failed to acquire store lock")?;

  let plan = BuildPlan::new(&catalog, &requests, &overrides, store).context("Failed to resolve build plan")?;
  let base_env = default_base_env();
  let make_jobs = args.make_jobs.unwrap_or_else(default_jobs);

  let packages: Vec<PlannedPackage> = plan
    .packages()
    .iter()
    .enumerate()
    .map(|(pos, package)| {
      let rendered = plan
        .compose_environment(pos, &base_env, make_jobs)
        .map_err(|e| e.to_string())
        .and_then(|env| {
          plan
            .render_steps(pos, &env, make_jobs, args.shell.as_deref())
            .map_err(|e| e.to_string())
        });
      let (steps, error) = match rendered {
        Ok(steps) => (steps, None),
        Err(e) => (Vec::new(), Some(e)),
      };

      PlannedPackage {
        name: package.formula.name.clone(),
        version: package.formula.version.clone(),
        fingerprint: package.fingerprint.0.clone(),
        install_path: package.install_path.clone(),
        cached: store.exists(&package.key),
        dependencies: plan.dependencies(pos).iter().map(|&d| plan.package(d).label()).collect(),
        options: package.options.clone(),
        steps,
        error,
      }
    })
    .collect();

  let output = PlanOutput {
    requested: plan.requested().iter().map(|&pos| plan.package(pos).label()).collect(),
    waves: plan
      .waves()
      .iter()
      .map(|wave| wave.iter().map(|&pos| plan.package(pos).label()).collect())
      .collect(),
    packages,
  };

  if args.json {
    print_json(&output)?;
  } else {
    print_plan(&output);
  }
  Ok(())
}

fn default_jobs() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

fn print_plan(output: &PlanOutput) {
  let cached = output.packages.iter().filter(|p| p.cached).count();
  print_info(&format!(
    "Plan: {} package(s), {} to build, {} cached, {} wave(s)",
    output.packages.len(),
    output.packages.len() - cached,
    cached,
    output.waves.len()
  ));

  for (i, package) in output.packages.iter().enumerate() {
    println!();
    let state = if package.cached { "cached" } else { "build" };
    println!(
      "{:>3}. {}@{} {}",
      i + 1,
      package.name,
      package.version,
      format!("[{}]", state).if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
    println!("     fingerprint: {}", package.fingerprint);
    println!("     path: {}", package.install_path.display());
    if !package.dependencies.is_empty() {
      println!("     after: {}", package.dependencies.join(", "));
    }
    for (option, enabled) in &package.options {
      println!("     option {}: {}", option, if *enabled { "on" } else { "off" });
    }
    if !package.cached {
      for step in &package.steps {
        println!("     {} {}", symbols::ARROW, step);
      }
    }
    if let Some(error) = &package.error {
      println!(
        "     {} {}",
        symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()),
        error
      );
    }
  }

  println!();
  println!("Waves:");
  for (i, wave) in output.waves.iter().enumerate() {
    println!("  {}: {}", i + 1, wave.join(", "));
  }
}
