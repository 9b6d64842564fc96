//! Build environment composition.
//!
//! A package's build environment is composed fresh for every build from:
//!
//! 1. the orchestrator's base environment,
//! 2. the `exports` of every transitive build-time dependency, in resolution order,
//! 3. the package's own `env` operations, applied last.
//!
//! Values are placeholder-substituted per contribution: `$${prefix}` is the
//! install path of the formula that contributed the operation, and
//! `$${env:VAR}` reads the environment accumulated so far.

mod types;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::trace;

pub use types::{EnvOp, Environment};

use crate::placeholder::{self, PlaceholderError, Scope};
use crate::platform::PATH_LIST_SEPARATOR;

/// An environment operation could not be resolved.
#[derive(Debug, Clone, Error)]
#[error("cannot compose {var} from {package}: {source}")]
pub struct EnvironmentCompositionError {
  pub package: String,
  pub var: String,
  #[source]
  pub source: PlaceholderError,
}

/// The operations one formula contributes, with the values its placeholders see.
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
  pub package: &'a str,
  /// Install path of the contributing formula.
  pub prefix: &'a str,
  pub options: &'a BTreeMap<String, bool>,
  pub ops: &'a [EnvOp],
}

/// Values shared by every contribution of one composition.
#[derive(Debug, Clone, Copy)]
pub struct CompositionContext<'a> {
  /// Install paths of every package in the build closure, by name.
  pub dependencies: &'a BTreeMap<String, String>,
  pub jobs: &'a str,
  pub path_separator: &'a str,
}

impl<'a> CompositionContext<'a> {
  pub fn new(dependencies: &'a BTreeMap<String, String>, jobs: &'a str) -> Self {
    Self {
      dependencies,
      jobs,
      path_separator: PATH_LIST_SEPARATOR,
    }
  }
}

/// Compose the environment for one package.
///
/// `exports` must already be in resolution order; `own` is applied last.
pub fn compose(
  base: &Environment,
  exports: &[Contribution<'_>],
  own: &Contribution<'_>,
  ctx: &CompositionContext<'_>,
) -> Result<Environment, EnvironmentCompositionError> {
  let mut env = base.clone();
  for contribution in exports.iter().chain(std::iter::once(own)) {
    apply_contribution(&mut env, contribution, ctx)?;
  }
  Ok(env)
}

/// Apply one formula's operations to `env` in order.
pub fn apply_contribution(
  env: &mut Environment,
  contribution: &Contribution<'_>,
  ctx: &CompositionContext<'_>,
) -> Result<(), EnvironmentCompositionError> {
  for op in contribution.ops {
    let value = match op.value() {
      Some(raw) => {
        let scope = Scope {
          prefix: Some(contribution.prefix),
          jobs: Some(ctx.jobs),
          dependencies: Some(ctx.dependencies),
          options: Some(contribution.options),
          env: Some(env.as_map()),
          ..Default::default()
        };
        placeholder::substitute(raw, &scope).map_err(|source| EnvironmentCompositionError {
          package: contribution.package.to_string(),
          var: op.var().to_string(),
          source,
        })?
      }
      None => String::new(),
    };
    trace!(package = contribution.package, var = op.var(), "applying env op");
    env.apply(op, &value, ctx.path_separator);
  }
  Ok(())
}
