//! Implementation of the `keg build` command.
//!
//! Resolves the requested formulas against the catalog and builds them into
//! the store, printing one status line per package as it finishes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::watch;
use tracing::debug;

use keg_lib::execute::{BuildStatus, ExecuteConfig, Orchestrator, ProgressEvent, RunReport, ShellRunner};
use keg_lib::store::{FsStore, LockMode};

use super::{OptionArgs, load_catalog, parse_requests};
use crate::output::{format_duration, print_error, print_json, print_record, print_stat, print_success, print_warning};

#[derive(Args, Debug)]
pub struct BuildArgs {
  /// Formulas to build, as NAME or NAME@VERSION
  #[arg(required = true)]
  names: Vec<String>,

  /// Stop starting new packages after the first failure
  #[arg(long)]
  fail_fast: bool,

  /// Packages built concurrently (default: number of CPUs)
  #[arg(short, long)]
  jobs: Option<usize>,

  /// Make jobs per package (default: number of CPUs)
  #[arg(long)]
  make_jobs: Option<usize>,

  #[command(flatten)]
  options: OptionArgs,

  /// Kill any build step running longer than this (e.g. "30m")
  #[arg(long, value_parser = humantime::parse_duration)]
  step_timeout: Option<Duration>,

  /// Shell for shell steps
  #[arg(long)]
  shell: Option<String>,

  /// Write the run report as JSON to this file
  #[arg(long)]
  report: Option<PathBuf>,

  /// Print the run report as JSON instead of status lines
  #[arg(long)]
  json: bool,
}

pub fn cmd_build(args: BuildArgs, catalog_path: &Path, store: FsStore) -> Result<ExitCode> {
  let catalog = load_catalog(catalog_path)?;
  let requests = parse_requests(&args.names)?;

  let _lock = store
    .lock(LockMode::Exclusive, "build")
    .context("Failed to acquire store lock")?;

  let mut config = ExecuteConfig {
    fail_fast: args.fail_fast,
    options: args.options.overrides()?,
    shell: args.shell,
    step_timeout: args.step_timeout,
    ..Default::default()
  };
  if let Some(jobs) = args.jobs {
    config.jobs = jobs;
  }
  if let Some(make_jobs) = args.make_jobs {
    config.make_jobs = make_jobs;
  }

  let json = args.json;
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let result = rt.block_on(async {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        debug!("received Ctrl-C");
        let _ = cancel_tx.send(true);
      }
    });

    let mut orchestrator = Orchestrator::new(store, ShellRunner, config);
    orchestrator
      .run(&catalog, &requests, cancel_rx, &mut |event| {
        if !json && let ProgressEvent::Finished(record) = event {
          print_record(record);
        }
      })
      .await
  });

  let report = match result {
    Ok(report) => report,
    Err(e) => {
      if let Some(path) = &args.report {
        RunReport::failed(args.names.clone()).write_json(path)?;
      }
      return Err(e).context("Build failed");
    }
  };

  if let Some(path) = &args.report {
    report.write_json(path)?;
  }

  if json {
    print_json(&report)?;
  } else {
    print_summary(&report);
  }

  Ok(if report.is_success() {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

fn print_summary(report: &RunReport) {
  for failure in report.failures() {
    println!();
    print_error(&format!("{} failed", failure.label()));
    if let Some(error) = &failure.error {
      for line in error.lines() {
        println!("    {}", line);
      }
    }
    if let Some(tail) = &failure.output_tail
      && !tail.is_empty()
    {
      println!("  output:");
      for line in tail.lines() {
        println!("    | {}", line);
      }
    }
  }

  println!();
  if report.is_success() {
    print_success(&format!("Build complete ({})", report.state));
  } else {
    print_warning(&format!("Build {}", report.state));
  }
  print_stat("Built", &report.count(BuildStatus::Success).to_string());
  print_stat("Cached", &report.count(BuildStatus::Skipped).to_string());
  print_stat("Failed", &report.count(BuildStatus::Failed).to_string());
  print_stat("Aborted", &report.count(BuildStatus::Aborted).to_string());
  print_stat("Duration", &format_duration(report.duration()));
}
