//! Realizing one package: fetch, run its steps, seal the install.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::fetch;
use super::plan::BuildPlan;
use super::runner::{Invocation, ProcessRunner, StepOutput};
use super::steps;
use super::types::{BuildError, BuildStepError, ExecuteConfig};
use crate::placeholder::Scope;
use crate::store::{ArtifactStore, InstallKey};

/// Lines of combined output kept in a step error.
const OUTPUT_TAIL_LINES: usize = 20;

const TEMP_VARS: &[&str] = &["TMPDIR", "TMP", "TEMP", "TEMPDIR"];

/// What `build_package` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// A verified install already existed; no steps ran.
  Cached,
  Built { steps: usize },
}

/// Removes a partial install prefix unless disarmed.
struct PrefixGuard<'a, S: ArtifactStore + ?Sized> {
  store: &'a S,
  key: &'a InstallKey,
  armed: bool,
}

impl<S: ArtifactStore + ?Sized> PrefixGuard<'_, S> {
  fn disarm(mut self) {
    self.armed = false;
  }
}

impl<S: ArtifactStore + ?Sized> Drop for PrefixGuard<'_, S> {
  fn drop(&mut self) {
    if self.armed {
      debug!(key = %self.key, "discarding partial install");
      if let Err(e) = self.store.discard(self.key) {
        warn!(key = %self.key, error = %e, "failed to discard partial install");
      }
    }
  }
}

/// Build the package at `position` of `plan` into `store`.
///
/// Dropping the returned future stops the running step and removes the
/// partial install and the working directory.
pub async fn build_package<S, R>(
  plan: &BuildPlan,
  position: usize,
  config: &ExecuteConfig,
  store: &Arc<S>,
  runner: &R,
) -> Result<Outcome, BuildError>
where
  S: ArtifactStore + ?Sized + 'static,
  R: ProcessRunner,
{
  let package = plan.package(position);
  let formula = &package.formula;
  let key = &package.key;

  if installed(store, key).await {
    info!(formula = %formula.label(), fingerprint = %package.fingerprint, "already installed");
    return Ok(Outcome::Cached);
  }

  let env = plan.compose_environment(position, &config.base_env, config.make_jobs)?;
  let store: &S = store;

  let prefix = store.prepare(key)?;
  let guard = PrefixGuard {
    store,
    key,
    armed: true,
  };

  let tmp_root = store.tmp_dir();
  std::fs::create_dir_all(&tmp_root).map_err(|e| BuildError::io(&tmp_root, e))?;
  let work = tempfile::Builder::new()
    .prefix(&format!("{}-", formula.name))
    .tempdir_in(&tmp_root)
    .map_err(|e| BuildError::io(&tmp_root, e))?;
  let work_dir = dunce::canonicalize(work.path()).map_err(|e| BuildError::io(work.path(), e))?;

  let src_dir = work_dir.join("src");
  match &formula.source {
    Some(source) => {
      let archive = fetch::fetch(&formula.name, source, &store.download_dir()).await?;
      fetch::unpack(&archive, &src_dir, &fetch::url_to_filename(&source.url)).await?;
    }
    None => create_dir(&src_dir)?,
  }

  let mut resources = std::collections::BTreeMap::new();
  if !formula.resources.is_empty() {
    let resource_dir = work_dir.join("resources");
    create_dir(&resource_dir)?;
    for resource in &formula.resources {
      let file = fetch::fetch(&resource.name, &resource.source, &store.download_dir()).await?;
      let dest = resource_dir.join(&resource.name);
      tokio::fs::copy(&file, &dest).await.map_err(|e| BuildError::io(&dest, e))?;
      resources.insert(resource.name.clone(), dest.to_string_lossy().into_owned());
    }
  }

  let step_tmp = work_dir.join("tmp");
  create_dir(&step_tmp)?;

  let log_dir = store.log_dir(key);
  if log_dir.exists() {
    std::fs::remove_dir_all(&log_dir).map_err(|e| BuildError::io(&log_dir, e))?;
  }
  create_dir(&log_dir)?;

  let prefix_str = prefix.to_string_lossy().into_owned();
  let src_str = src_dir.to_string_lossy().into_owned();
  let work_str = work_dir.to_string_lossy().into_owned();
  let dependencies = plan.dependency_paths(position);
  let jobs = plan.jobs_for(position, config.make_jobs);
  let scope = Scope {
    prefix: Some(&prefix_str),
    src: Some(&src_str),
    work: Some(&work_str),
    jobs: Some(&jobs),
    dependencies: Some(&dependencies),
    options: Some(&package.options),
    env: Some(env.as_map()),
    resources: Some(&resources),
  };

  let mut step_env = env.as_map().clone();
  let tmp_str = step_tmp.to_string_lossy().into_owned();
  for var in TEMP_VARS {
    step_env.insert(var.to_string(), tmp_str.clone());
  }

  for (i, step) in formula.steps.iter().enumerate() {
    let number = i + 1;
    let mut invocation = steps::render(step, number, &scope, config.shell.as_deref())?;
    invocation.env = step_env.clone();

    debug!(formula = %formula.label(), step = number, kind = step.kind(), command = %invocation.command_line(), "running step");
    let run = runner.run(&invocation);
    let output = match config.step_timeout {
      Some(timeout) => tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| BuildError::Timeout {
          step: number,
          kind: step.kind(),
          timeout,
        })?,
      None => run.await,
    }
    .map_err(|e| BuildError::io(Path::new(&invocation.program), e))?;

    let log_path = log_dir.join(format!("{number:02}-{}.log", step.kind()));
    write_log(&log_path, &invocation, &output)?;

    if !output.success() {
      return Err(
        BuildStepError {
          step: number,
          kind: step.kind(),
          command: invocation.command_line(),
          exit_code: output.exit_code,
          log_path,
          output_tail: output_tail(&output, OUTPUT_TAIL_LINES),
        }
        .into(),
      );
    }
  }

  store.install(key)?;
  guard.disarm();
  info!(formula = %formula.label(), path = %prefix.display(), steps = formula.steps.len(), "installed");
  Ok(Outcome::Built {
    steps: formula.steps.len(),
  })
}

fn create_dir(path: &Path) -> Result<(), BuildError> {
  std::fs::create_dir_all(path).map_err(|e| BuildError::io(path, e))
}

fn write_log(path: &Path, invocation: &Invocation, output: &StepOutput) -> Result<(), BuildError> {
  let status = match output.exit_code {
    Some(code) => format!("exit code {code}"),
    None => "terminated by signal".to_string(),
  };
  let content = format!(
    "$ {}\n# cwd: {}\n# {status}\n\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
    invocation.command_line(),
    invocation.cwd.display(),
    String::from_utf8_lossy(&output.stdout),
    String::from_utf8_lossy(&output.stderr),
  );
  std::fs::write(path, content).map_err(|e| BuildError::io(path, e))
}

/// Last `lines` lines of stdout followed by stderr.
/// Verifying an install re-hashes its whole tree, so it runs on the blocking
/// pool.
async fn installed<S: ArtifactStore + ?Sized + 'static>(store: &Arc<S>, key: &InstallKey) -> bool {
  let store = Arc::clone(store);
  let key = key.clone();
  match tokio::task::spawn_blocking(move || store.exists(&key)).await {
    Ok(exists) => exists,
    Err(e) => {
      warn!(error = %e, "install check did not complete, will rebuild");
      false
    }
  }
}

fn output_tail(output: &StepOutput, lines: usize) -> String {
  let stdout = String::from_utf8_lossy(&output.stdout);
  let stderr = String::from_utf8_lossy(&output.stderr);
  let all: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
  all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;
  use std::sync::Mutex;

  use crate::env::{EnvOp, Environment};
  use crate::formula::{BuildStep, Catalog, Dependency, FormulaDef, OptionOverrides, Source};
  use crate::resolve::Request;
  use crate::store::FsStore;
  use crate::util::hash::hash_bytes;
  use tempfile::TempDir;

  /// Records invocations; fails any whose command line contains `fail_on`.
  #[derive(Default)]
  struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    fail_on: Option<String>,
  }

  impl ProcessRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<StepOutput> {
      self.calls.lock().unwrap().push(invocation.clone());
      let failed = self
        .fail_on
        .as_ref()
        .is_some_and(|needle| invocation.command_line().contains(needle.as_str()));
      Ok(StepOutput {
        exit_code: Some(if failed { 2 } else { 0 }),
        stdout: b"checking for gcc... yes\n".to_vec(),
        stderr: if failed { b"error: boom\n".to_vec() } else { Vec::new() },
      })
    }
  }

  fn config() -> ExecuteConfig {
    let mut base_env = Environment::new();
    base_env.set("PATH", "/usr/bin");
    ExecuteConfig {
      jobs: 1,
      make_jobs: 4,
      base_env,
      ..Default::default()
    }
  }

  fn plan_for(formulas: Vec<FormulaDef>, request: &str, store: &FsStore) -> BuildPlan {
    let catalog = Catalog::new(formulas).unwrap();
    BuildPlan::new(&catalog, &[Request::new(request)], &OptionOverrides::new(), store).unwrap()
  }

  fn zlib() -> FormulaDef {
    let mut zlib = FormulaDef::new("zlib", "1.2.8");
    zlib.env = vec![EnvOp::Set {
      var: "CFLAGS".to_string(),
      value: "-fPIC".to_string(),
    }];
    zlib.steps = vec![BuildStep::configure(&["--static"]), BuildStep::compile(None), BuildStep::install(&[])];
    zlib
  }

  #[tokio::test]
  async fn runs_steps_and_seals_install() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp.path()));
    let plan = plan_for(vec![zlib()], "zlib", &store);
    let runner = FakeRunner::default();

    let outcome = build_package(&plan, 0, &config(), &store, &runner).await.unwrap();
    assert_eq!(outcome, Outcome::Built { steps: 3 });
    assert!(store.exists(&plan.package(0).key));

    let calls = runner.calls.lock().unwrap();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].program.ends_with("configure"));
    assert_eq!(calls[1].command_line(), "make -j4");
    assert_eq!(calls[0].env.get("CFLAGS").map(String::as_str), Some("-fPIC"));
    assert!(calls[0].env.contains_key("TMPDIR"));
    assert!(!calls[0].env.contains_key("HOME"));

    let logs = store.log_dir(&plan.package(0).key);
    assert!(logs.join("01-configure.log").exists());
    assert!(logs.join("03-install.log").exists());
  }

  #[tokio::test]
  async fn second_build_is_cached() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp.path()));
    let plan = plan_for(vec![zlib()], "zlib", &store);

    build_package(&plan, 0, &config(), &store, &FakeRunner::default()).await.unwrap();
    let runner = FakeRunner::default();
    let outcome = build_package(&plan, 0, &config(), &store, &runner).await.unwrap();

    assert_eq!(outcome, Outcome::Cached);
    assert!(runner.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn failing_step_stops_and_cleans_up() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp.path()));
    let plan = plan_for(vec![zlib()], "zlib", &store);
    let runner = FakeRunner {
      fail_on: Some("make -j".to_string()),
      ..Default::default()
    };

    let err = build_package(&plan, 0, &config(), &store, &runner).await.unwrap_err();
    let BuildError::StepFailed(step) = err else {
      panic!("expected a step failure, got {err}");
    };
    assert_eq!(step.step, 2);
    assert_eq!(step.kind, "compile");
    assert_eq!(step.exit_code, Some(2));
    assert!(step.output_tail.ends_with("error: boom"));
    assert!(step.log_path.ends_with("02-compile.log"));

    // Install never ran, the prefix and working directory are gone
    assert_eq!(runner.calls.lock().unwrap().len(), 2);
    assert!(!store.install_path(&plan.package(0).key).exists());
    assert_eq!(std::fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn environment_errors_fail_before_any_step() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp.path()));
    let mut broken = FormulaDef::new("lz4", "r131");
    broken.env = vec![EnvOp::Append {
      var: "CFLAGS".to_string(),
      value: "$${env:NOT_SET}".to_string(),
    }];
    broken.steps = vec![BuildStep::shell("true")];
    let plan = plan_for(vec![broken], "lz4", &store);
    let runner = FakeRunner::default();

    let err = build_package(&plan, 0, &config(), &store, &runner).await.unwrap_err();
    assert!(matches!(err, BuildError::Environment(_)));
    assert!(runner.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn fetches_and_unpacks_source_and_resources() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp.path().join("store")));
    let patch = temp.path().join("fix.patch");
    std::fs::write(&patch, "--- a\n+++ b\n").unwrap();

    let mut snappy = FormulaDef::new("snappy", "1.1.3");
    snappy.source = Some(Source {
      url: format!("file://{}", patch.display()),
      sha256: hash_bytes(b"--- a\n+++ b\n").0,
      mirrors: vec![],
    });
    snappy.resources = vec![crate::formula::Resource {
      name: "extra".to_string(),
      source: snappy.source.clone().unwrap(),
    }];
    snappy.steps = vec![BuildStep::shell("cat $${src}/fix.patch $${resource:extra}")];
    let plan = plan_for(vec![snappy], "snappy", &store);
    let runner = FakeRunner::default();

    build_package(&plan, 0, &config(), &store, &runner).await.unwrap();
    let calls = runner.calls.lock().unwrap();
    let command = calls[0].args.last().unwrap();
    assert!(command.contains("/src/fix.patch"));
    assert!(command.contains("/resources/extra"));
  }

  #[tokio::test]
  async fn dependency_paths_reach_steps() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp.path()));
    let mut openssl = FormulaDef::new("openssl", "1.0.2h");
    openssl.dependencies = vec![Dependency::build("zlib")];
    openssl.steps = vec![BuildStep::configure(&["--with-zlib-lib=$${dep:zlib}/lib"])];
    let plan = plan_for(vec![zlib(), openssl], "openssl", &store);
    let runner = FakeRunner::default();

    build_package(&plan, 1, &config(), &store, &runner).await.unwrap();
    let calls = runner.calls.lock().unwrap();
    let expected = format!("--with-zlib-lib={}/lib", plan.package(0).install_path.display());
    assert_eq!(calls[0].args[1], expected);
  }

  #[tokio::test]
  async fn slow_step_times_out() {
    struct SlowRunner;
    impl ProcessRunner for SlowRunner {
      async fn run(&self, _invocation: &Invocation) -> std::io::Result<StepOutput> {
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        Ok(StepOutput::default())
      }
    }

    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp.path()));
    let plan = plan_for(vec![zlib()], "zlib", &store);
    let config = ExecuteConfig {
      step_timeout: Some(std::time::Duration::from_millis(50)),
      ..config()
    };

    let err = build_package(&plan, 0, &config, &store, &SlowRunner).await.unwrap_err();
    assert!(matches!(err, BuildError::Timeout { step: 1, kind: "configure", .. }));
    assert!(!store.install_path(&plan.package(0).key).exists());
  }

  #[test]
  fn output_tail_keeps_last_lines() {
    let output = StepOutput {
      exit_code: Some(1),
      stdout: (1..=30).map(|i| format!("line {i}\n")).collect::<String>().into_bytes(),
      stderr: b"fatal\n".to_vec(),
    };
    let tail = output_tail(&output, 3);
    assert_eq!(tail, "line 29\nline 30\nfatal");
  }

  #[test]
  fn unused_dependency_map_is_empty() {
    let temp = TempDir::new().unwrap();
    let store = FsStore::new(temp.path());
    let plan = plan_for(vec![zlib()], "zlib", &store);
    assert_eq!(plan.dependency_paths(0), BTreeMap::new());
  }

  #[tokio::test]
  async fn install_check_verifies_tree_on_blocking_pool() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp.path()));
    let plan = plan_for(vec![zlib()], "zlib", &store);
    let key = &plan.package(0).key;
    assert!(!installed(&store, key).await);

    build_package(&plan, 0, &config(), &store, &FakeRunner::default()).await.unwrap();
    assert!(installed(&store, key).await);

    std::fs::write(store.install_path(key).join("stray.h"), "tampered").unwrap();
    assert!(!installed(&store, key).await);
  }
}
