//! Process runner: the seam between build steps and the operating system.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// A fully rendered command: nothing in it refers to placeholders or to the
/// parent process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: PathBuf,
  /// The complete environment of the child.
  pub env: BTreeMap<String, String>,
}

impl Invocation {
  /// Program and arguments joined for display.
  pub fn command_line(&self) -> String {
    std::iter::once(self.program.as_str())
      .chain(self.args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
  /// `None` when the process was terminated by a signal.
  pub exit_code: Option<i32>,
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
}

impl StepOutput {
  pub fn success(&self) -> bool {
    self.exit_code == Some(0)
  }
}

/// Runs one invocation to completion.
///
/// Dropping the returned future must stop the child process.
pub trait ProcessRunner: Send + Sync {
  fn run(&self, invocation: &Invocation) -> impl Future<Output = io::Result<StepOutput>> + Send;
}

/// Spawns invocations with Tokio in a cleared environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl ProcessRunner for ShellRunner {
  async fn run(&self, invocation: &Invocation) -> io::Result<StepOutput> {
    debug!(program = %invocation.program, cwd = %invocation.cwd.display(), "spawning process");

    let output = Command::new(&invocation.program)
      .args(&invocation.args)
      .current_dir(&invocation.cwd)
      .env_clear()
      .envs(&invocation.env)
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .output()
      .await?;

    Ok(StepOutput {
      exit_code: output.status.code(),
      stdout: output.stdout,
      stderr: output.stderr,
    })
  }
}

/// Shell program and the arguments that precede the command string.
///
/// Interactive shells may source profiles that change the environment, so
/// the default is always the plain system shell.
pub fn shell_command(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
