//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output including colored status
//! messages, per-package status lines, and human-readable durations.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

use keg_lib::execute::{BuildRecord, BuildStatus};

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIP: &str = "=";
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// One line describing where a package ended up.
pub fn status_line(record: &BuildRecord) -> String {
  let label = record.label();
  match record.status {
    BuildStatus::Success => format!("{label} built in {}", format_duration(record.duration())),
    BuildStatus::Skipped => format!("{label} already installed"),
    BuildStatus::Failed => format!("{label} failed after {}", format_duration(record.duration())),
    BuildStatus::Aborted => match &record.aborted_by {
      Some(by) => format!("{label} aborted ({by})"),
      None => format!("{label} aborted"),
    },
    BuildStatus::Pending | BuildStatus::Building => format!("{label} {}", record.status),
  }
}

/// Print the status line of a finished package on stdout.
pub fn print_record(record: &BuildRecord) {
  let line = status_line(record);
  match record.status {
    BuildStatus::Success => print_success(&line),
    BuildStatus::Skipped => println!(
      "{} {}",
      symbols::SKIP.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      line
    ),
    BuildStatus::Failed => println!(
      "{} {}",
      symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()),
      line.if_supports_color(Stream::Stdout, |s| s.red())
    ),
    BuildStatus::Aborted => println!(
      "{} {}",
      symbols::WARNING.if_supports_color(Stream::Stdout, |s| s.yellow()),
      line
    ),
    BuildStatus::Pending | BuildStatus::Building => print_info(&line),
  }
}
