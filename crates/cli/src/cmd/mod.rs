mod build;
mod env;
mod list;
mod plan;

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use clap::Args;

use keg_lib::formula::{Catalog, OptionOverrides};
use keg_lib::resolve::Request;

pub use build::{BuildArgs, cmd_build};
pub use env::{EnvArgs, cmd_env};
pub use list::{ListArgs, cmd_list};
pub use plan::{PlanArgs, cmd_plan};

/// `--with` / `--without` option overrides.
#[derive(Args, Debug, Default)]
pub struct OptionArgs {
  /// Enable an option (repeatable)
  #[arg(long = "with", value_name = "FORMULA:OPTION")]
  with: Vec<String>,

  /// Disable an option (repeatable)
  #[arg(long = "without", value_name = "FORMULA:OPTION")]
  without: Vec<String>,
}

impl OptionArgs {
  pub fn overrides(&self) -> Result<OptionOverrides> {
    let mut overrides = OptionOverrides::new();
    for spec in &self.with {
      overrides.set_spec(spec, true).map_err(|e| anyhow!(e))?;
    }
    for spec in &self.without {
      overrides.set_spec(spec, false).map_err(|e| anyhow!(e))?;
    }
    Ok(overrides)
  }
}

pub fn load_catalog(path: &Path) -> Result<Catalog> {
  Catalog::load(path).with_context(|| format!("Failed to load catalog: {}", path.display()))
}

pub fn parse_requests(names: &[String]) -> Result<Vec<Request>> {
  names
    .iter()
    .map(|name| name.parse::<Request>().with_context(|| format!("Invalid formula request: {}", name)))
    .collect()
}
