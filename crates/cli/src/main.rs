mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use keg_lib::consts::{CATALOG_ENV, DEFAULT_CATALOG, STORE_ENV};
use keg_lib::store::{FsStore, default_store_root};

use cmd::{BuildArgs, EnvArgs, ListArgs, PlanArgs};

/// keg - dependency-graph build orchestrator for formula catalogs
#[derive(Parser)]
#[command(name = "keg")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Catalog of formulas (.lua or .json)
  #[arg(long, global = true, env = CATALOG_ENV, default_value = DEFAULT_CATALOG)]
  catalog: PathBuf,

  /// Store root (default: the user data directory)
  #[arg(long, global = true, env = STORE_ENV)]
  store: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build formulas and everything they depend on
  Build(BuildArgs),

  /// Show what a build would do without running anything
  Plan(PlanArgs),

  /// Print the composed build environment of a formula
  Env(EnvArgs),

  /// List the formulas of the catalog
  List(ListArgs),
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let store = FsStore::new(cli.store.clone().unwrap_or_else(default_store_root));

  match cli.command {
    Commands::Build(args) => cmd::cmd_build(args, &cli.catalog, store),
    Commands::Plan(args) => cmd::cmd_plan(args, &cli.catalog, &store).map(|()| ExitCode::SUCCESS),
    Commands::Env(args) => cmd::cmd_env(args, &cli.catalog, &store).map(|()| ExitCode::SUCCESS),
    Commands::List(args) => cmd::cmd_list(args, &cli.catalog, cli.verbose).map(|()| ExitCode::SUCCESS),
  }
}
