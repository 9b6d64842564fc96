use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One environment mutation contributed by a formula.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EnvOp {
  /// Remove the accumulated value.
  Reset { var: String },
  /// Replace the accumulated value.
  Set { var: String, value: String },
  /// `old + " " + value`, or `value` when old is empty.
  Append { var: String, value: String },
  /// `value + " " + old`, or `value` when old is empty.
  Prepend { var: String, value: String },
  /// Like `Append` with the platform path-list separator.
  AppendPath { var: String, value: String },
  /// Like `Prepend` with the platform path-list separator.
  PrependPath { var: String, value: String },
}

impl EnvOp {
  pub fn var(&self) -> &str {
    match self {
      EnvOp::Reset { var }
      | EnvOp::Set { var, .. }
      | EnvOp::Append { var, .. }
      | EnvOp::Prepend { var, .. }
      | EnvOp::AppendPath { var, .. }
      | EnvOp::PrependPath { var, .. } => var,
    }
  }

  /// The raw (unsubstituted) value, `None` for `Reset`.
  pub fn value(&self) -> Option<&str> {
    match self {
      EnvOp::Reset { .. } => None,
      EnvOp::Set { value, .. }
      | EnvOp::Append { value, .. }
      | EnvOp::Prepend { value, .. }
      | EnvOp::AppendPath { value, .. }
      | EnvOp::PrependPath { value, .. } => Some(value),
    }
  }
}

/// A concrete set of environment variables.
///
/// Always an owned value: composing one never reads or writes the process
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment {
  vars: BTreeMap<String, String>,
}

impl Environment {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, var: &str) -> Option<&str> {
    self.vars.get(var).map(String::as_str)
  }

  pub fn set(&mut self, var: impl Into<String>, value: impl Into<String>) {
    self.vars.insert(var.into(), value.into());
  }

  pub fn remove(&mut self, var: &str) -> Option<String> {
    self.vars.remove(var)
  }

  pub fn contains(&self, var: &str) -> bool {
    self.vars.contains_key(var)
  }

  pub fn len(&self) -> usize {
    self.vars.len()
  }

  pub fn is_empty(&self) -> bool {
    self.vars.is_empty()
  }

  /// Variables sorted by name.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn as_map(&self) -> &BTreeMap<String, String> {
    &self.vars
  }

  /// Apply `op` with an already-substituted value, joining lists with
  /// `path_separator` for the `*_path` variants.
  pub fn apply(&mut self, op: &EnvOp, value: &str, path_separator: &str) {
    let var = op.var();
    match op {
      EnvOp::Reset { .. } => {
        self.vars.remove(var);
      }
      EnvOp::Set { .. } => self.set(var, value),
      EnvOp::Append { .. } => self.join(var, value, " ", false),
      EnvOp::Prepend { .. } => self.join(var, value, " ", true),
      EnvOp::AppendPath { .. } => self.join(var, value, path_separator, false),
      EnvOp::PrependPath { .. } => self.join(var, value, path_separator, true),
    }
  }

  fn join(&mut self, var: &str, value: &str, separator: &str, front: bool) {
    let joined = match self.vars.get(var).filter(|old| !old.is_empty()) {
      Some(old) if front => format!("{value}{separator}{old}"),
      Some(old) => format!("{old}{separator}{value}"),
      None => value.to_string(),
    };
    self.vars.insert(var.to_string(), joined);
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self {
      vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
    }
  }
}
