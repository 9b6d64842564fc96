//! Hashing utilities for fingerprints and install verification.
//!
//! - `Fingerprint`: truncated hash identifying one configured build of a formula
//! - `ContentHash`: full SHA-256 used for checksums and install-tree verification
//! - `hash_tree()`: deterministic hash of a directory's contents

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::FINGERPRINT_LEN;

/// Identity of a configured build: name, version, definition, options and
/// the fingerprints of everything it was built against.
///
/// Lowercase hex, truncated to keep install paths readable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Types whose JSON serialization defines their fingerprint.
pub trait Fingerprintable: Serialize {
  fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
    let serialized = serde_json::to_string(self)?;
    let full = hash_bytes(serialized.as_bytes());
    Ok(Fingerprint(full.0[..FINGERPRINT_LEN].to_string()))
  }
}

/// A full 64-character SHA-256 hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum TreeHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// File contents, directory structure and symlink targets are included;
/// timestamps and permissions are not. Top-level entries whose name is in
/// `exclude` are skipped along with everything below them.
pub fn hash_tree(path: &Path, exclude: &[&str]) -> Result<ContentHash, TreeHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.depth() != 1 || e.file_name().to_str().map(|n| !exclude.contains(&n)).unwrap_or(true));

  for entry in walker {
    let entry = entry.map_err(|e| TreeHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .replace('\\', "/");

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let line = if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| TreeHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      format!("L:{}:{}", rel_path, hash_bytes(target.to_string_lossy().as_bytes()))
    } else if file_type.is_file() {
      format!("F:{}:{}", rel_path, hash_file(entry_path)?)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else {
      continue;
    };

    entries.push((rel_path, line));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, line) in entries {
    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, TreeHashError> {
  let read_err = |e: std::io::Error| TreeHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let n = file.read(&mut buffer).map_err(read_err)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[derive(Serialize)]
  struct Probe {
    name: &'static str,
  }

  impl Fingerprintable for Probe {}

  #[test]
  fn fingerprint_is_truncated_and_stable() {
    let a = Probe { name: "zlib" }.fingerprint().unwrap();
    let b = Probe { name: "zlib" }.fingerprint().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.0.len(), FINGERPRINT_LEN);
    assert_ne!(a, Probe { name: "bzip2" }.fingerprint().unwrap());
  }

  #[test]
  fn hash_bytes_matches_known_digest() {
    assert_eq!(
      hash_bytes(b"hello").0,
      "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
  }

  #[test]
  fn tree_hash_changes_with_content() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("lib.a"), "original").unwrap();
    let before = hash_tree(temp.path(), &[]).unwrap();

    fs::write(temp.path().join("lib.a"), "modified").unwrap();
    let after = hash_tree(temp.path(), &[]).unwrap();

    assert_ne!(before, after);
  }

  #[test]
  fn tree_hash_ignores_excluded_entries() {
    let temp = tempdir().unwrap();
    fs::create_dir(temp.path().join("lib")).unwrap();
    fs::write(temp.path().join("lib/libz.a"), "archive").unwrap();
    let before = hash_tree(temp.path(), &[".keg-complete"]).unwrap();

    fs::write(temp.path().join(".keg-complete"), "marker").unwrap();
    let after = hash_tree(temp.path(), &[".keg-complete"]).unwrap();

    assert_eq!(before, after);
  }

  #[test]
  fn tree_hash_distinguishes_structure() {
    let flat = tempdir().unwrap();
    fs::write(flat.path().join("zlib.h"), "header").unwrap();

    let nested = tempdir().unwrap();
    fs::create_dir(nested.path().join("include")).unwrap();
    fs::write(nested.path().join("include/zlib.h"), "header").unwrap();

    assert_ne!(
      hash_tree(flat.path(), &[]).unwrap(),
      hash_tree(nested.path(), &[]).unwrap()
    );
  }
}
