//! Store layout.
//!
//! ```text
//! <store>/
//! ├── .lock                            # Store lock (flock / LockFileEx)
//! ├── obj/<name>-<version>-<fp>/       # Install prefixes
//! │   └── .keg-complete                # Completion marker with output hash
//! ├── logs/<name>-<fp>/NN-<step>.log   # Step logs
//! ├── downloads/<sha256>-<filename>    # Verified download cache
//! └── tmp/                             # Per-build working directories
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::consts::STORE_ENV;
use crate::platform::paths::data_dir;
use crate::util::hash::Fingerprint;

pub const OBJ_DIR: &str = "obj";
pub const LOGS_DIR: &str = "logs";
pub const DOWNLOADS_DIR: &str = "downloads";
pub const TMP_DIR: &str = "tmp";
pub const LOCK_FILENAME: &str = ".lock";

/// Store root: `$KEG_STORE`, else `<data dir>/store`.
pub fn default_store_root() -> PathBuf {
  if let Ok(path) = std::env::var(STORE_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  data_dir().join("store")
}

/// Identifies one install in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstallKey {
  pub name: String,
  pub version: String,
  pub fingerprint: Fingerprint,
}

impl InstallKey {
  pub fn new(name: &str, version: &str, fingerprint: Fingerprint) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      fingerprint,
    }
  }

  /// `<name>-<version>-<fingerprint>`
  pub fn dir_name(&self) -> String {
    format!("{}-{}-{}", self.name, self.version, self.fingerprint)
  }

  /// `<name>-<fingerprint>`
  pub fn log_dir_name(&self) -> String {
    format!("{}-{}", self.name, self.fingerprint)
  }
}

impl fmt::Display for InstallKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{} ({})", self.name, self.version, self.fingerprint)
  }
}

pub fn install_path(root: &Path, key: &InstallKey) -> PathBuf {
  root.join(OBJ_DIR).join(key.dir_name())
}

pub fn log_dir(root: &Path, key: &InstallKey) -> PathBuf {
  root.join(LOGS_DIR).join(key.log_dir_name())
}
