use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::env::EnvOp;
use crate::util::hash::{Fingerprint, Fingerprintable};

/// A downloadable archive with its expected SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
  pub url: String,
  pub sha256: String,
  /// Fallback URLs, tried in order when `url` cannot be fetched.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub mirrors: Vec<String>,
}

impl Source {
  /// The primary URL followed by every mirror.
  pub fn urls(&self) -> impl Iterator<Item = &str> {
    std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
  }
}

/// An auxiliary download made available to the build steps (e.g. a CA bundle).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
  pub name: String,
  #[serde(flatten)]
  pub source: Source,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
  /// Must be installed before this formula's steps run.
  #[default]
  Build,
  /// Must be installed before anything that executes this formula's output.
  Runtime,
  /// Ordered like a build dependency, but only when something else pulls it in.
  Optional,
}

impl fmt::Display for DependencyKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DependencyKind::Build => write!(f, "build"),
      DependencyKind::Runtime => write!(f, "runtime"),
      DependencyKind::Optional => write!(f, "optional"),
    }
  }
}

/// A dependency declaration.
///
/// Catalogs may write either a bare name (a build dependency) or a table
/// `{ name = "...", kind = "runtime", version = "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "DependencySpec")]
pub struct Dependency {
  pub name: String,
  pub kind: DependencyKind,
  /// Exact version of the record to select.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
}

impl Dependency {
  pub fn new(name: &str, kind: DependencyKind) -> Self {
    Self {
      name: name.to_string(),
      kind,
      version: None,
    }
  }

  pub fn build(name: &str) -> Self {
    Self::new(name, DependencyKind::Build)
  }

  pub fn runtime(name: &str) -> Self {
    Self::new(name, DependencyKind::Runtime)
  }

  pub fn optional(name: &str) -> Self {
    Self::new(name, DependencyKind::Optional)
  }

  pub fn pinned(mut self, version: &str) -> Self {
    self.version = Some(version.to_string());
    self
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencySpec {
  Name(String),
  Full {
    name: String,
    #[serde(default)]
    kind: DependencyKind,
    #[serde(default)]
    version: Option<String>,
  },
}

impl From<DependencySpec> for Dependency {
  fn from(spec: DependencySpec) -> Self {
    match spec {
      DependencySpec::Name(name) => Dependency {
        name,
        kind: DependencyKind::Build,
        version: None,
      },
      DependencySpec::Full { name, kind, version } => Dependency { name, kind, version },
    }
  }
}

/// A named boolean build option.
///
/// Options carry a fixed default; runs may override them, and the effective
/// value is part of the fingerprint. Steps read them through `$${opt:NAME}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormulaOption {
  #[serde(default)]
  pub default: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub desc: Option<String>,
}

/// One step of a build procedure.
///
/// Arguments may contain placeholders (`$${prefix}`, `$${src}`, `$${jobs}`,
/// `$${dep:NAME}`, `$${opt:NAME}`, `$${env:VAR}`, `$${resource:NAME}`,
/// `$${work}`), substituted just before the step runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum BuildStep {
  /// `<script> --prefix=<prefix> args...`, run from the source directory.
  Configure {
    #[serde(default)]
    args: Vec<String>,
    /// Configure script to invoke, `./configure` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<String>,
  },
  /// `make -j<jobs> [target]`.
  Compile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
  },
  /// `make install args...`.
  Install {
    #[serde(default)]
    args: Vec<String>,
  },
  /// A raw command handed to the shell.
  Shell {
    cmd: String,
    /// Working directory relative to the source directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
  },
}

impl BuildStep {
  pub fn configure(args: &[&str]) -> Self {
    BuildStep::Configure {
      args: args.iter().map(|a| a.to_string()).collect(),
      script: None,
    }
  }

  pub fn compile(target: Option<&str>) -> Self {
    BuildStep::Compile {
      target: target.map(str::to_string),
    }
  }

  pub fn install(args: &[&str]) -> Self {
    BuildStep::Install {
      args: args.iter().map(|a| a.to_string()).collect(),
    }
  }

  pub fn shell(cmd: &str) -> Self {
    BuildStep::Shell {
      cmd: cmd.to_string(),
      cwd: None,
    }
  }

  /// Short name used in logs and log file names.
  pub fn kind(&self) -> &'static str {
    match self {
      BuildStep::Configure { .. } => "configure",
      BuildStep::Compile { .. } => "compile",
      BuildStep::Install { .. } => "install",
      BuildStep::Shell { .. } => "shell",
    }
  }
}

/// A package record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormulaDef {
  pub name: String,
  pub version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub desc: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub homepage: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<Source>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub resources: Vec<Resource>,
  #[serde(default)]
  pub dependencies: Vec<Dependency>,
  /// Contributions applied to this formula's own build environment.
  #[serde(default)]
  pub env: Vec<EnvOp>,
  /// Contributions applied to the build environment of every dependent.
  #[serde(default)]
  pub exports: Vec<EnvOp>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub options: BTreeMap<String, FormulaOption>,
  /// Build with a single make job regardless of the run's job count.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub deparallelize: bool,
  #[serde(default)]
  pub steps: Vec<BuildStep>,
}

impl FormulaDef {
  pub fn new(name: &str, version: &str) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      desc: None,
      homepage: None,
      source: None,
      resources: Vec::new(),
      dependencies: Vec::new(),
      env: Vec::new(),
      exports: Vec::new(),
      options: BTreeMap::new(),
      deparallelize: false,
      steps: Vec::new(),
    }
  }

  /// `name@version`, used in messages.
  pub fn label(&self) -> String {
    format!("{}@{}", self.name, self.version)
  }

  pub fn dependencies_of(&self, kind: DependencyKind) -> impl Iterator<Item = &Dependency> {
    self.dependencies.iter().filter(move |d| d.kind == kind)
  }

  /// Effective option values: declared defaults, then overrides for this formula.
  pub fn effective_options(&self, overrides: &OptionOverrides) -> BTreeMap<String, bool> {
    let mut values: BTreeMap<String, bool> = self.options.iter().map(|(k, o)| (k.clone(), o.default)).collect();
    for (option, value) in overrides.for_formula(&self.name) {
      if values.contains_key(option) {
        values.insert(option.clone(), *value);
      }
    }
    values
  }

  /// Compute the fingerprint of this formula built with `options` against
  /// dependencies with the given fingerprints (in resolution order).
  pub fn fingerprint(
    &self,
    options: &BTreeMap<String, bool>,
    dependencies: &[&Fingerprint],
  ) -> Result<Fingerprint, serde_json::Error> {
    FingerprintInput {
      formula: self,
      options,
      dependencies,
    }
    .fingerprint()
  }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
  formula: &'a FormulaDef,
  options: &'a BTreeMap<String, bool>,
  dependencies: &'a [&'a Fingerprint],
}

impl Fingerprintable for FingerprintInput<'_> {}

/// Per-run option overrides, keyed by formula name then option name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionOverrides {
  values: BTreeMap<String, BTreeMap<String, bool>>,
}

impl OptionOverrides {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, formula: &str, option: &str, value: bool) {
    self
      .values
      .entry(formula.to_string())
      .or_default()
      .insert(option.to_string(), value);
  }

  /// Parse a `formula:option` pair as given on the command line.
  pub fn set_spec(&mut self, spec: &str, value: bool) -> Result<(), String> {
    match spec.split_once(':') {
      Some((formula, option)) if !formula.is_empty() && !option.is_empty() => {
        self.set(formula, option, value);
        Ok(())
      }
      _ => Err(format!("expected FORMULA:OPTION, got '{spec}'")),
    }
  }

  pub fn for_formula(&self, formula: &str) -> impl Iterator<Item = (&String, &bool)> {
    self.values.get(formula).into_iter().flat_map(|m| m.iter())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rocksdb() -> FormulaDef {
    let mut def = FormulaDef::new("rocksdb", "4.5.1");
    def.source = Some(Source {
      url: "https://github.com/facebook/rocksdb/archive/v4.5.1.tar.gz".to_string(),
      sha256: "c6a23a82352dd6bb6bd580db51beafe4c5efa382b16b722c100ce2e7d1a5e497".to_string(),
      mirrors: vec![],
    });
    def.dependencies = vec![Dependency::build("snappy"), Dependency::build("lz4")];
    def.options.insert(
      "lite".to_string(),
      FormulaOption {
        default: true,
        desc: Some("Build mobile/non-flash optimized lite version".to_string()),
      },
    );
    def.steps = vec![
      BuildStep::compile(Some("static_lib")),
      BuildStep::install(&["INSTALL_PATH=$${prefix}"]),
    ];
    def
  }

  mod deserialize {
    use super::*;

    #[test]
    fn bare_dependency_name_is_build_kind() {
      let json = r#"{
        "name": "thrift",
        "version": "0.9.3",
        "dependencies": ["openssl", { "name": "bison", "kind": "build" }, { "name": "python", "kind": "optional" }]
      }"#;
      let def: FormulaDef = serde_json::from_str(json).unwrap();

      assert_eq!(def.dependencies[0], Dependency::build("openssl"));
      assert_eq!(def.dependencies[1], Dependency::build("bison"));
      assert_eq!(def.dependencies[2], Dependency::optional("python"));
    }

    #[test]
    fn dependency_version_pin_is_kept() {
      let json = r#"{ "name": "gcc", "version": "6.1.0", "dependencies": [{ "name": "glibc", "version": "2.13" }] }"#;
      let def: FormulaDef = serde_json::from_str(json).unwrap();

      assert_eq!(def.dependencies[0], Dependency::build("glibc").pinned("2.13"));
    }

    #[test]
    fn steps_use_step_tag() {
      let json = r#"{
        "name": "pcre",
        "version": "8.38",
        "steps": [
          { "step": "configure", "args": ["--enable-utf8"] },
          { "step": "compile" },
          { "step": "install" },
          { "step": "shell", "cmd": "rm -rf $${prefix}/share" }
        ]
      }"#;
      let def: FormulaDef = serde_json::from_str(json).unwrap();

      assert_eq!(def.steps.len(), 4);
      assert_eq!(def.steps[0], BuildStep::configure(&["--enable-utf8"]));
      assert_eq!(def.steps[1], BuildStep::compile(None));
      assert_eq!(def.steps[2], BuildStep::install(&[]));
      assert_eq!(def.steps[3].kind(), "shell");
    }

    #[test]
    fn missing_optional_fields_default() {
      let def: FormulaDef = serde_json::from_str(r#"{ "name": "asio", "version": "1.10.6" }"#).unwrap();

      assert!(def.source.is_none());
      assert!(def.dependencies.is_empty());
      assert!(def.env.is_empty());
      assert!(!def.deparallelize);
    }
  }

  mod options {
    use super::*;

    #[test]
    fn defaults_apply_without_overrides() {
      let opts = rocksdb().effective_options(&OptionOverrides::new());
      assert_eq!(opts.get("lite"), Some(&true));
    }

    #[test]
    fn override_replaces_default() {
      let mut overrides = OptionOverrides::new();
      overrides.set_spec("rocksdb:lite", false).unwrap();

      let opts = rocksdb().effective_options(&overrides);
      assert_eq!(opts.get("lite"), Some(&false));
    }

    #[test]
    fn undeclared_override_is_ignored() {
      let mut overrides = OptionOverrides::new();
      overrides.set("rocksdb", "universal", true);

      let opts = rocksdb().effective_options(&overrides);
      assert!(!opts.contains_key("universal"));
    }

    #[test]
    fn malformed_spec_is_rejected() {
      let mut overrides = OptionOverrides::new();
      assert!(overrides.set_spec("rocksdb", true).is_err());
      assert!(overrides.set_spec(":lite", true).is_err());
    }
  }

  mod fingerprint {
    use super::*;

    #[test]
    fn is_deterministic() {
      let def = rocksdb();
      let opts = def.effective_options(&OptionOverrides::new());
      assert_eq!(def.fingerprint(&opts, &[]).unwrap(), def.fingerprint(&opts, &[]).unwrap());
    }

    #[test]
    fn changes_with_option_value() {
      let def = rocksdb();
      let on = def.effective_options(&OptionOverrides::new());
      let mut off = on.clone();
      off.insert("lite".to_string(), false);

      assert_ne!(def.fingerprint(&on, &[]).unwrap(), def.fingerprint(&off, &[]).unwrap());
    }

    #[test]
    fn changes_with_dependency_fingerprint() {
      let def = rocksdb();
      let opts = def.effective_options(&OptionOverrides::new());
      let snappy_a = Fingerprint("aaaaaaaaaaaaaaaaaaaa".to_string());
      let snappy_b = Fingerprint("bbbbbbbbbbbbbbbbbbbb".to_string());

      assert_ne!(
        def.fingerprint(&opts, &[&snappy_a]).unwrap(),
        def.fingerprint(&opts, &[&snappy_b]).unwrap()
      );
    }

    #[test]
    fn changes_when_step_order_differs() {
      let def = rocksdb();
      let mut reordered = def.clone();
      reordered.steps.reverse();
      let opts = def.effective_options(&OptionOverrides::new());

      assert_ne!(def.fingerprint(&opts, &[]).unwrap(), reordered.fingerprint(&opts, &[]).unwrap());
    }
  }
}
