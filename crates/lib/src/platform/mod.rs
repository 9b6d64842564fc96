//! Host platform detection and well-known directories.

pub mod arch;
pub mod os;
pub mod paths;

use std::fmt;

use arch::Arch;
use os::Os;

/// Platform identifier combining architecture and OS (e.g., "x86_64-linux").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
}

impl Platform {
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// Detect the current platform, `None` when it is not supported.
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  pub fn triple(&self) -> String {
    format!("{}-{}", self.arch, self.os)
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.triple())
  }
}

/// Separator for path-list variables such as `PATH` or `LIBRARY_PATH`.
#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: &str = ";";

/// Separator for path-list variables such as `PATH` or `LIBRARY_PATH`.
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: &str = ":";

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn triple_format() {
    assert_eq!(Platform::new(Arch::X86_64, Os::Linux).triple(), "x86_64-linux");
    assert_eq!(Platform::new(Arch::Aarch64, Os::MacOs).triple(), "aarch64-darwin");
  }
}
