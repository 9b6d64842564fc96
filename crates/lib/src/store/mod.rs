//! The artifact store.
//!
//! Every configured build installs into its own prefix under `obj/`, named by
//! its fingerprint. A prefix only counts as installed once its completion
//! marker exists and the marker's output hash still matches the tree, so an
//! interrupted or tampered install is rebuilt rather than trusted.

mod lock;
pub mod paths;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use lock::{LockMetadata, LockMode, StoreLock, StoreLockError};
pub use paths::{InstallKey, default_store_root};

use crate::consts::COMPLETE_MARKER;
use crate::util::hash::{TreeHashError, hash_tree};

/// Entries excluded from the output hash of an install prefix.
const HASH_EXCLUSIONS: &[&str] = &[COMPLETE_MARKER];

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid completion marker at {path}: {message}")]
  Marker { path: PathBuf, message: String },

  #[error(transparent)]
  TreeHash(#[from] TreeHashError),
}

impl StoreError {
  fn io(path: &Path, source: std::io::Error) -> Self {
    StoreError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Contents of the completion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMarker {
  pub name: String,
  pub version: String,
  pub fingerprint: String,
  /// Full SHA-256 of the prefix, excluding the marker itself.
  pub output_hash: String,
}

/// Where builds install and how completed installs are recognised.
pub trait ArtifactStore: Send + Sync {
  /// Install prefix for `key`, whether or not it exists yet.
  fn install_path(&self, key: &InstallKey) -> PathBuf;

  /// True when `key` has a complete, verified install.
  fn exists(&self, key: &InstallKey) -> bool;

  /// Clear any stale prefix for `key` and create it empty.
  fn prepare(&self, key: &InstallKey) -> Result<PathBuf, StoreError>;

  /// Seal the prefix of `key` as installed.
  fn install(&self, key: &InstallKey) -> Result<InstallMarker, StoreError>;

  /// Remove a partial install of `key`.
  fn discard(&self, key: &InstallKey) -> Result<(), StoreError>;

  /// Directory holding the step logs of `key`.
  fn log_dir(&self, key: &InstallKey) -> PathBuf;

  /// Content-addressed cache of verified downloads.
  fn download_dir(&self) -> PathBuf;

  /// Parent of per-build working directories.
  fn tmp_dir(&self) -> PathBuf;
}

/// The filesystem store.
#[derive(Debug, Clone)]
pub struct FsStore {
  root: PathBuf,
}

impl FsStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Store at `$KEG_STORE` or the default data directory.
  pub fn from_env() -> Self {
    Self::new(default_store_root())
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Take the store lock.
  pub fn lock(&self, mode: LockMode, command: &str) -> Result<StoreLock, StoreLockError> {
    StoreLock::acquire(&self.root, mode, command)
  }

  /// Read the completion marker of `key`, `None` if absent.
  pub fn read_marker(&self, key: &InstallKey) -> Result<Option<InstallMarker>, StoreError> {
    let marker_path = self.install_path(key).join(COMPLETE_MARKER);
    if !marker_path.exists() {
      return Ok(None);
    }

    let content = std::fs::read_to_string(&marker_path).map_err(|e| StoreError::io(&marker_path, e))?;
    let marker = serde_json::from_str(&content).map_err(|e| StoreError::Marker {
      path: marker_path.clone(),
      message: e.to_string(),
    })?;
    Ok(Some(marker))
  }

  fn verify(&self, key: &InstallKey, marker: &InstallMarker) -> bool {
    let path = self.install_path(key);
    match hash_tree(&path, HASH_EXCLUSIONS) {
      Ok(current) if current.0 == marker.output_hash => true,
      Ok(current) => {
        warn!(
          path = %path.display(),
          expected = %marker.output_hash,
          actual = %current,
          "install modified since it was sealed, will rebuild"
        );
        false
      }
      Err(e) => {
        warn!(path = %path.display(), error = %e, "failed to hash install, will rebuild");
        false
      }
    }
  }
}

impl ArtifactStore for FsStore {
  fn install_path(&self, key: &InstallKey) -> PathBuf {
    paths::install_path(&self.root, key)
  }

  fn exists(&self, key: &InstallKey) -> bool {
    match self.read_marker(key) {
      Ok(Some(marker)) => marker.fingerprint == key.fingerprint.0 && self.verify(key, &marker),
      Ok(None) => false,
      Err(e) => {
        debug!(key = %key, error = %e, "unreadable marker, treating as not installed");
        false
      }
    }
  }

  fn prepare(&self, key: &InstallKey) -> Result<PathBuf, StoreError> {
    let path = self.install_path(key);
    if path.exists() {
      debug!(path = %path.display(), "removing incomplete install");
      std::fs::remove_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
    }
    std::fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
    Ok(path)
  }

  fn install(&self, key: &InstallKey) -> Result<InstallMarker, StoreError> {
    let path = self.install_path(key);
    let output_hash = hash_tree(&path, HASH_EXCLUSIONS)?;

    let marker = InstallMarker {
      name: key.name.clone(),
      version: key.version.clone(),
      fingerprint: key.fingerprint.0.clone(),
      output_hash: output_hash.0,
    };
    let content = serde_json::to_string(&marker).map_err(|e| StoreError::Marker {
      path: path.clone(),
      message: e.to_string(),
    })?;

    let marker_path = path.join(COMPLETE_MARKER);
    std::fs::write(&marker_path, format!("{content}\n")).map_err(|e| StoreError::io(&marker_path, e))?;
    debug!(path = %path.display(), "install sealed");
    Ok(marker)
  }

  fn discard(&self, key: &InstallKey) -> Result<(), StoreError> {
    let path = self.install_path(key);
    match std::fs::remove_dir_all(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(StoreError::io(&path, e)),
    }
  }

  fn log_dir(&self, key: &InstallKey) -> PathBuf {
    paths::log_dir(&self.root, key)
  }

  fn download_dir(&self) -> PathBuf {
    self.root.join(paths::DOWNLOADS_DIR)
  }

  fn tmp_dir(&self) -> PathBuf {
    self.root.join(paths::TMP_DIR)
  }
}
