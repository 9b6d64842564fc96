//! Build execution: the orchestrator driving a whole run.
//!
//! The orchestrator resolves a plan, then schedules packages as soon as all
//! of their ordering dependencies are satisfied, up to `jobs` at a time.
//! It is the only writer of the Build Record table: tasks report back
//! through the `JoinSet` and every status transition happens here.
//!
//! Failure handling:
//! - a failed package aborts everything that transitively depends on it,
//! - independent packages keep going unless fail-fast is requested,
//! - cancellation aborts in-flight tasks (killing their processes) and marks
//!   pending packages aborted.

pub mod fetch;
pub mod plan;
pub mod realize;
pub mod runner;
pub mod steps;
pub mod types;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::formula::Catalog;
use crate::resolve::Request;
use crate::store::ArtifactStore;

pub use plan::{BuildPlan, PackagePlan};
pub use realize::{Outcome, build_package};
pub use runner::{Invocation, ProcessRunner, ShellRunner, StepOutput};
pub use types::{
  BuildError, BuildRecord, BuildStatus, BuildStepError, ExecuteConfig, ExecuteError, OrchestratorState, ProgressEvent,
  RunReport, default_base_env,
};

type TaskResult = (usize, Result<Outcome, BuildError>, Duration);

/// Drives resolution and the builds of one run.
pub struct Orchestrator<S, R> {
  store: Arc<S>,
  runner: Arc<R>,
  config: Arc<ExecuteConfig>,
  state: OrchestratorState,
}

impl<S, R> Orchestrator<S, R>
where
  S: ArtifactStore + 'static,
  R: ProcessRunner + 'static,
{
  pub fn new(store: S, runner: R, config: ExecuteConfig) -> Self {
    Self {
      store: Arc::new(store),
      runner: Arc::new(runner),
      config: Arc::new(config),
      state: OrchestratorState::Init,
    }
  }

  pub fn state(&self) -> OrchestratorState {
    self.state
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  /// Resolve `requests` and build them.
  ///
  /// Configuration errors (unknown names, cycles, ambiguous versions) are
  /// returned as `Err` with the state set to `Failed`; no step runs. Build
  /// failures are not errors: they are recorded in the report, whose state
  /// is `Completed` only when every package succeeded or was skipped.
  ///
  /// Setting `cancel` to `true` stops the run.
  pub async fn run(
    &mut self,
    catalog: &Catalog,
    requests: &[Request],
    mut cancel: watch::Receiver<bool>,
    reporter: &mut dyn FnMut(&ProgressEvent),
  ) -> Result<RunReport, ExecuteError> {
    let started = Instant::now();
    self.transition(OrchestratorState::Resolving, reporter);

    let plan = match BuildPlan::new(catalog, requests, &self.config.options, self.store.as_ref()) {
      Ok(plan) => Arc::new(plan),
      Err(e) => {
        error!(error = %e, "resolution failed");
        self.transition(OrchestratorState::Failed, reporter);
        return Err(e);
      }
    };

    self.transition(OrchestratorState::Building, reporter);
    info!(packages = plan.len(), jobs = self.config.jobs, "starting build run");

    let mut records: Vec<BuildRecord> = plan
      .packages()
      .iter()
      .map(|p| BuildRecord::pending(&p.formula.name, &p.formula.version, &p.fingerprint.0, &p.install_path))
      .collect();
    let dependencies: Vec<Vec<usize>> = (0..plan.len()).map(|pos| plan.dependencies(pos)).collect();

    let jobs = self.config.jobs.max(1);
    let mut join_set: JoinSet<TaskResult> = JoinSet::new();
    let mut running: BTreeSet<usize> = BTreeSet::new();
    let mut stop_reason: Option<&'static str> = None;
    let mut cancelled = *cancel.borrow();
    let mut watch_cancel = true;
    if cancelled {
      stop_reason = Some("cancelled");
    }

    loop {
      if stop_reason.is_none() {
        for pos in 0..records.len() {
          if join_set.len() >= jobs {
            break;
          }
          let ready = records[pos].status == BuildStatus::Pending
            && dependencies[pos].iter().all(|&d| records[d].status.is_satisfied());
          if !ready {
            continue;
          }

          records[pos].status = BuildStatus::Building;
          running.insert(pos);
          reporter(&ProgressEvent::Started {
            name: records[pos].package_name.clone(),
            version: records[pos].version.clone(),
          });
          self.spawn(&mut join_set, &plan, pos);
        }
      }

      if join_set.is_empty() {
        break;
      }

      tokio::select! {
        joined = join_set.join_next() => match joined {
          Some(Ok((pos, result, elapsed))) => {
            running.remove(&pos);
            let cause = cancelled.then_some("cancelled");
            let failed = self.finish(&plan, &mut records, pos, result, elapsed, cause, reporter);
            if failed && self.config.fail_fast && stop_reason.is_none() {
              warn!("fail-fast: not starting any more packages");
              stop_reason = Some("fail-fast");
            }
          }
          Some(Err(e)) if e.is_panic() => error!(error = %e, "build task panicked"),
          Some(Err(_)) | None => {}
        },
        changed = cancel.changed(), if watch_cancel && !cancelled => match changed {
          Ok(()) if *cancel.borrow_and_update() => {
            warn!(running = running.len(), "cancelling build run");
            cancelled = true;
            stop_reason = Some("cancelled");
            join_set.abort_all();
          }
          Ok(()) => {}
          Err(_) => watch_cancel = false,
        },
      }
    }

    // Tasks that never reported back were aborted or panicked
    for pos in std::mem::take(&mut running) {
      let err = if cancelled {
        BuildError::Cancelled
      } else {
        BuildError::io(&plan.package(pos).install_path, std::io::Error::other("build task panicked"))
      };
      let cause = cancelled.then_some("cancelled");
      self.finish(&plan, &mut records, pos, Err(err), Duration::ZERO, cause, reporter);
    }

    let reason = stop_reason.unwrap_or("unsatisfied dependencies");
    for record in records.iter_mut().filter(|r| r.status == BuildStatus::Pending) {
      record.status = BuildStatus::Aborted;
      record.aborted_by = Some(reason.to_string());
      reporter(&ProgressEvent::Finished(record.clone()));
    }

    let final_state = if records.iter().all(|r| r.status.is_satisfied()) {
      OrchestratorState::Completed
    } else {
      OrchestratorState::Aborted
    };

    let report = RunReport {
      state: final_state,
      requested: plan.requested().iter().map(|&pos| plan.package(pos).label()).collect(),
      records,
      duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(
      state = %final_state,
      success = report.count(BuildStatus::Success),
      skipped = report.count(BuildStatus::Skipped),
      failed = report.count(BuildStatus::Failed),
      aborted = report.count(BuildStatus::Aborted),
      "build run finished"
    );
    self.transition(final_state, reporter);
    Ok(report)
  }

  fn spawn(&self, join_set: &mut JoinSet<TaskResult>, plan: &Arc<BuildPlan>, pos: usize) {
    let plan = Arc::clone(plan);
    let store = Arc::clone(&self.store);
    let runner = Arc::clone(&self.runner);
    let config = Arc::clone(&self.config);

    join_set.spawn(async move {
      let started = Instant::now();
      let result = build_package(&plan, pos, &config, &store, runner.as_ref()).await;
      (pos, result, started.elapsed())
    });
  }

  /// Record the result of one package. Returns true if it failed.
  ///
  /// Dependents of a failed package are aborted on behalf of `stop_reason`
  /// when the run is stopping, else on behalf of the failed package.
  #[allow(clippy::too_many_arguments)]
  fn finish(
    &self,
    plan: &BuildPlan,
    records: &mut [BuildRecord],
    pos: usize,
    result: Result<Outcome, BuildError>,
    elapsed: Duration,
    stop_reason: Option<&str>,
    reporter: &mut dyn FnMut(&ProgressEvent),
  ) -> bool {
    let record = &mut records[pos];
    record.duration_ms = elapsed.as_millis() as u64;

    let failed = match result {
      Ok(Outcome::Cached) => {
        record.status = BuildStatus::Skipped;
        false
      }
      Ok(Outcome::Built { steps }) => {
        record.status = BuildStatus::Success;
        record.steps_run = steps;
        false
      }
      Err(e) => {
        error!(formula = %record.label(), error = %e, "build failed");
        if let BuildError::StepFailed(step) = &e {
          record.steps_run = step.step;
          record.log_path = Some(step.log_path.clone());
          record.output_tail = Some(step.output_tail.clone());
        }
        record.status = BuildStatus::Failed;
        record.error = Some(e.to_string());
        true
      }
    };
    reporter(&ProgressEvent::Finished(record.clone()));

    if failed {
      let label = stop_reason.map_or_else(|| records[pos].label(), str::to_string);
      for dependent in plan.dependents_closure(pos) {
        let record = &mut records[dependent];
        if record.status == BuildStatus::Pending {
          warn!(formula = %record.label(), failed_dependency = %label, "aborting dependent");
          record.status = BuildStatus::Aborted;
          record.aborted_by = Some(label.clone());
          reporter(&ProgressEvent::Finished(record.clone()));
        }
      }
    }
    failed
  }

  fn transition(&mut self, state: OrchestratorState, reporter: &mut dyn FnMut(&ProgressEvent)) {
    self.state = state;
    reporter(&ProgressEvent::State(state));
  }
}

/// Build `requests` without cancellation or progress reporting.
pub async fn run<S, R>(
  store: S,
  runner: R,
  config: ExecuteConfig,
  catalog: &Catalog,
  requests: &[Request],
) -> Result<RunReport, ExecuteError>
where
  S: ArtifactStore + 'static,
  R: ProcessRunner + 'static,
{
  let (_cancel_tx, cancel_rx) = watch::channel(false);
  Orchestrator::new(store, runner, config)
    .run(catalog, requests, cancel_rx, &mut |_| {})
    .await
}
