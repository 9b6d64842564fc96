//! Rendering typed build steps into concrete invocations.

use std::collections::BTreeMap;
use std::path::Path;

use super::runner::{Invocation, shell_command};
use super::types::BuildError;
use crate::formula::BuildStep;
use crate::placeholder::{self, PlaceholderError, Scope};

/// Render `step` into an invocation with an empty environment.
///
/// `number` is the 1-based position of the step, used in errors. The scope
/// must provide `src` and `prefix`; `cwd` is resolved against `src`.
pub fn render(
  step: &BuildStep,
  number: usize,
  scope: &Scope<'_>,
  shell: Option<&str>,
) -> Result<Invocation, BuildError> {
  let wrap = |source: PlaceholderError| BuildError::Placeholder {
    step: number,
    kind: step.kind(),
    source,
  };
  let sub = |raw: &str| placeholder::substitute(raw, scope).map_err(wrap);
  let sub_all = |raw: &[String]| raw.iter().map(|a| sub(a)).collect::<Result<Vec<_>, _>>();

  let src = scope.src.ok_or(PlaceholderError::Unavailable("src")).map_err(wrap)?;
  let prefix = scope.prefix.ok_or(PlaceholderError::Unavailable("prefix")).map_err(wrap)?;
  let src_dir = Path::new(src);

  let (program, args, cwd) = match step {
    BuildStep::Configure { args, script } => {
      let script = match script {
        Some(script) => sub(script)?,
        None => "configure".to_string(),
      };
      let program = src_dir.join(script).to_string_lossy().into_owned();
      let mut rendered = vec![format!("--prefix={prefix}")];
      rendered.extend(sub_all(args)?);
      (program, rendered, src_dir.to_path_buf())
    }
    BuildStep::Compile { target } => {
      let jobs = scope.jobs.ok_or(PlaceholderError::Unavailable("jobs")).map_err(wrap)?;
      let mut rendered = vec![format!("-j{jobs}")];
      if let Some(target) = target {
        rendered.push(sub(target)?);
      }
      ("make".to_string(), rendered, src_dir.to_path_buf())
    }
    BuildStep::Install { args } => {
      let mut rendered = vec!["install".to_string()];
      rendered.extend(sub_all(args)?);
      ("make".to_string(), rendered, src_dir.to_path_buf())
    }
    BuildStep::Shell { cmd, cwd } => {
      let (program, mut rendered) = shell_command(shell);
      rendered.push(sub(cmd)?);
      let dir = match cwd {
        Some(cwd) => src_dir.join(sub(cwd)?),
        None => src_dir.to_path_buf(),
      };
      (program, rendered, dir)
    }
  };

  Ok(Invocation {
    program,
    args,
    cwd,
    env: BTreeMap::new(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Fixture {
    deps: BTreeMap<String, String>,
    options: BTreeMap<String, bool>,
    env: BTreeMap<String, String>,
    resources: BTreeMap<String, String>,
  }

  impl Fixture {
    fn new() -> Self {
      Self {
        deps: [("zlib".to_string(), "/store/obj/zlib-1.2.8-abc".to_string())].into(),
        options: [("static".to_string(), true)].into(),
        env: [("CFLAGS".to_string(), "-O2".to_string())].into(),
        resources: [("cacert".to_string(), "/work/resources/cacert".to_string())].into(),
      }
    }

    fn scope(&self) -> Scope<'_> {
      Scope {
        prefix: Some("/store/obj/openssl"),
        src: Some("/work/src"),
        work: Some("/work"),
        jobs: Some("8"),
        dependencies: Some(&self.deps),
        options: Some(&self.options),
        env: Some(&self.env),
        resources: Some(&self.resources),
      }
    }
  }

  #[test]
  fn configure_gets_prefix_first() {
    let fixture = Fixture::new();
    let step = BuildStep::configure(&["--with-zlib-lib=$${dep:zlib}/lib", "no-shared"]);

    let inv = render(&step, 1, &fixture.scope(), None).unwrap();
    assert_eq!(inv.program, "/work/src/configure");
    assert_eq!(
      inv.args,
      vec![
        "--prefix=/store/obj/openssl",
        "--with-zlib-lib=/store/obj/zlib-1.2.8-abc/lib",
        "no-shared"
      ]
    );
    assert_eq!(inv.cwd, Path::new("/work/src"));
  }

  #[test]
  fn configure_with_custom_script() {
    let fixture = Fixture::new();
    let step = BuildStep::Configure {
      args: vec![],
      script: Some("Configure".to_string()),
    };

    let inv = render(&step, 1, &fixture.scope(), None).unwrap();
    assert_eq!(inv.program, "/work/src/Configure");
  }

  #[test]
  fn compile_uses_jobs() {
    let fixture = Fixture::new();
    let inv = render(&BuildStep::compile(Some("static_lib")), 2, &fixture.scope(), None).unwrap();
    assert_eq!(inv.command_line(), "make -j8 static_lib");
  }

  #[test]
  fn install_passes_args() {
    let fixture = Fixture::new();
    let step = BuildStep::install(&["INSTALL_PREFIX=$${prefix}"]);
    let inv = render(&step, 3, &fixture.scope(), None).unwrap();
    assert_eq!(inv.command_line(), "make install INSTALL_PREFIX=/store/obj/openssl");
  }

  #[test]
  fn shell_substitutes_command_and_cwd() {
    let fixture = Fixture::new();
    let step = BuildStep::Shell {
      cmd: "cp $${resource:cacert} $${prefix}/cert.pem && echo $${opt:static}".to_string(),
      cwd: Some("build".to_string()),
    };

    let inv = render(&step, 4, &fixture.scope(), Some("/bin/bash")).unwrap();
    assert_eq!(inv.program, "/bin/bash");
    assert_eq!(inv.args[0], "-c");
    assert_eq!(inv.args[1], "cp /work/resources/cacert /store/obj/openssl/cert.pem && echo 1");
    assert_eq!(inv.cwd, Path::new("/work/src/build"));
  }

  #[test]
  fn unknown_placeholder_names_the_step() {
    let fixture = Fixture::new();
    let step = BuildStep::shell("echo $${dep:boost}");

    let err = render(&step, 5, &fixture.scope(), None).unwrap_err();
    match err {
      BuildError::Placeholder { step, kind, source } => {
        assert_eq!(step, 5);
        assert_eq!(kind, "shell");
        assert_eq!(source, PlaceholderError::UnknownDependency("boost".to_string()));
      }
      other => panic!("unexpected error: {other}"),
    }
  }
}
