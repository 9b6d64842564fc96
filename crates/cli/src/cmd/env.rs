//! Implementation of the `keg env` command.
//!
//! Prints the environment a formula's build steps would see: the base
//! environment, the exports of its dependencies and its own operations.

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Args;

use keg_lib::execute::{BuildPlan, default_base_env};
use keg_lib::store::{FsStore, LockMode};

use super::{OptionArgs, load_catalog, parse_requests};
use crate::output::print_json;

#[derive(Args, Debug)]
pub struct EnvArgs {
  /// Formula to inspect, as NAME or NAME@VERSION
  name: String,

  #[command(flatten)]
  options: OptionArgs,

  /// Value of $${jobs} (default: number of CPUs)
  #[arg(long)]
  make_jobs: Option<usize>,

  /// Output as JSON
  #[arg(long)]
  json: bool,
}

pub fn cmd_env(args: EnvArgs, catalog_path: &Path, store: &FsStore) -> Result<()> {
  let catalog = load_catalog(catalog_path)?;
  let requests = parse_requests(std::slice::from_ref(&args.name))?;
  let overrides = args.options.overrides()?;

  let _lock = store
    .lock(LockMode::Shared, "env")
    .context("Failed to acquire store lock")?;

  let plan = BuildPlan::new(&catalog, &requests, &overrides, store).context("Failed to resolve build plan")?;
  let Some(&position) = plan.requested().first() else {
    bail!("{} is not in the build plan", args.name);
  };

  let make_jobs = args
    .make_jobs
    .unwrap_or_else(|| std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4));
  let env = plan
    .compose_environment(position, &default_base_env(), make_jobs)
    .with_context(|| format!("Failed to compose environment of {}", plan.package(position).label()))?;

  if args.json {
    print_json(&env)?;
  } else {
    for (var, value) in env.iter() {
      println!("{}={}", var, value);
    }
  }
  Ok(())
}
