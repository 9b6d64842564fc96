//! Types for build execution: configuration, records, reports and errors.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::SOURCE_DATE_EPOCH;
use crate::env::{Environment, EnvironmentCompositionError};
use crate::formula::OptionOverrides;
use crate::placeholder::PlaceholderError;
use crate::resolve::ResolveError;
use crate::store::StoreError;

/// Lifecycle of one package within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
  Pending,
  Building,
  /// Built by this run.
  Success,
  Failed,
  /// A verified install already existed.
  Skipped,
  /// Never started: a dependency failed or the run stopped.
  Aborted,
}

impl BuildStatus {
  /// Dependents may start once a dependency reaches one of these.
  pub fn is_satisfied(self) -> bool {
    matches!(self, BuildStatus::Success | BuildStatus::Skipped)
  }

  pub fn is_terminal(self) -> bool {
    !matches!(self, BuildStatus::Pending | BuildStatus::Building)
  }
}

impl fmt::Display for BuildStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      BuildStatus::Pending => "pending",
      BuildStatus::Building => "building",
      BuildStatus::Success => "success",
      BuildStatus::Failed => "failed",
      BuildStatus::Skipped => "skipped",
      BuildStatus::Aborted => "aborted",
    };
    write!(f, "{s}")
  }
}

/// Orchestrator state machine.
///
/// `Init → Resolving → Building → {Completed, Aborted}`, or
/// `Resolving → Failed` on a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
  Init,
  Resolving,
  Building,
  /// Every package succeeded or was skipped.
  Completed,
  /// At least one package failed or was aborted.
  Aborted,
  /// Resolution failed; nothing was built.
  Failed,
}

impl fmt::Display for OrchestratorState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      OrchestratorState::Init => "init",
      OrchestratorState::Resolving => "resolving",
      OrchestratorState::Building => "building",
      OrchestratorState::Completed => "completed",
      OrchestratorState::Aborted => "aborted",
      OrchestratorState::Failed => "failed",
    };
    write!(f, "{s}")
  }
}

/// Outcome of one package in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
  pub package_name: String,
  pub version: String,
  pub fingerprint: String,
  pub status: BuildStatus,
  pub install_path: PathBuf,
  /// Present iff `status` is `failed`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub log_path: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output_tail: Option<String>,
  /// Present iff `status` is `aborted`: the failed dependency, or why the run stopped.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub aborted_by: Option<String>,
  pub duration_ms: u64,
  pub steps_run: usize,
}

impl BuildRecord {
  pub fn pending(name: &str, version: &str, fingerprint: &str, install_path: &Path) -> Self {
    Self {
      package_name: name.to_string(),
      version: version.to_string(),
      fingerprint: fingerprint.to_string(),
      status: BuildStatus::Pending,
      install_path: install_path.to_path_buf(),
      error: None,
      log_path: None,
      output_tail: None,
      aborted_by: None,
      duration_ms: 0,
      steps_run: 0,
    }
  }

  pub fn label(&self) -> String {
    format!("{}@{}", self.package_name, self.version)
  }

  pub fn duration(&self) -> Duration {
    Duration::from_millis(self.duration_ms)
  }
}

/// Records of a whole run plus its final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
  pub state: OrchestratorState,
  pub requested: Vec<String>,
  /// In build order.
  pub records: Vec<BuildRecord>,
  pub duration_ms: u64,
}

impl RunReport {
  /// A report for a run that never got past resolution.
  pub fn failed(requested: Vec<String>) -> Self {
    Self {
      state: OrchestratorState::Failed,
      requested,
      records: Vec::new(),
      duration_ms: 0,
    }
  }

  pub fn is_success(&self) -> bool {
    self.state == OrchestratorState::Completed
  }

  pub fn count(&self, status: BuildStatus) -> usize {
    self.records.iter().filter(|r| r.status == status).count()
  }

  pub fn record(&self, name: &str) -> Option<&BuildRecord> {
    self.records.iter().find(|r| r.package_name == name)
  }

  pub fn failures(&self) -> impl Iterator<Item = &BuildRecord> {
    self.records.iter().filter(|r| r.status == BuildStatus::Failed)
  }

  pub fn duration(&self) -> Duration {
    Duration::from_millis(self.duration_ms)
  }

  /// Write the report as pretty JSON.
  pub fn write_json(&self, path: &Path) -> Result<(), ExecuteError> {
    let content = serde_json::to_string_pretty(self).map_err(|e| ExecuteError::Report {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    std::fs::write(path, format!("{content}\n")).map_err(|e| ExecuteError::Report {
      path: path.to_path_buf(),
      message: e.to_string(),
    })
  }
}

/// Progress delivered to the reporter callback by the coordinator.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
  State(OrchestratorState),
  Started { name: String, version: String },
  Finished(BuildRecord),
}

/// Run configuration.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Packages built concurrently.
  pub jobs: usize,
  /// Value of `$${jobs}` (make parallelism) for formulas that allow it.
  pub make_jobs: usize,
  /// Stop launching packages after the first failure.
  pub fail_fast: bool,
  pub options: OptionOverrides,
  /// Starting point of every composed build environment.
  pub base_env: Environment,
  /// Shell for `shell` steps; `/bin/sh` (Unix) or PowerShell (Windows) when unset.
  pub shell: Option<String>,
  /// Kill a step that runs longer than this.
  pub step_timeout: Option<Duration>,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      jobs: num_cpus(),
      make_jobs: num_cpus(),
      fail_fast: false,
      options: OptionOverrides::default(),
      base_env: default_base_env(),
      shell: None,
      step_timeout: None,
    }
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// Minimal build environment: the host `PATH` (so toolchains are found), a
/// fake `HOME`, a C locale and a fixed `SOURCE_DATE_EPOCH`.
pub fn default_base_env() -> Environment {
  let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
  [
    ("PATH", path.as_str()),
    ("HOME", "/homeless-shelter"),
    ("LANG", "C"),
    ("LC_ALL", "C"),
    ("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH),
  ]
  .into_iter()
  .collect()
}

/// A build step exited unsuccessfully.
#[derive(Debug, Clone, Error)]
#[error(
  "step {step} ({kind}) failed with {}: {command}\n  log: {}",
  .exit_code.map(|c| format!("exit code {c}")).unwrap_or_else(|| "a signal".to_string()),
  .log_path.display()
)]
pub struct BuildStepError {
  /// 1-based step number.
  pub step: usize,
  pub kind: &'static str,
  pub command: String,
  pub exit_code: Option<i32>,
  pub log_path: PathBuf,
  /// Last lines of combined output.
  pub output_tail: String,
}

/// Why one package failed.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  StepFailed(#[from] BuildStepError),

  #[error(transparent)]
  Environment(#[from] EnvironmentCompositionError),

  #[error("step {step} ({kind}): {source}")]
  Placeholder {
    step: usize,
    kind: &'static str,
    #[source]
    source: PlaceholderError,
  },

  #[error("step {step} ({kind}) timed out after {timeout:?}")]
  Timeout {
    step: usize,
    kind: &'static str,
    timeout: Duration,
  },

  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  Integrity {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("failed to fetch {name}: {message}")]
  Fetch { name: String, message: String },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("build cancelled")]
  Cancelled,
}

impl BuildError {
  pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
    BuildError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Run-level failures.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error("failed to fingerprint {name}: {message}")]
  Fingerprint { name: String, message: String },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to write report {path}: {message}")]
  Report { path: PathBuf, message: String },
}
