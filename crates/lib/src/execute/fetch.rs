//! Source and resource fetching.
//!
//! Downloads land in the store's content-addressed download cache, keyed by
//! their expected SHA-256, and are only written there once verified. Mirrors
//! are tried in declaration order.

use std::io::Write;
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tokio::fs;
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;

use super::types::BuildError;
use crate::formula::Source;
use crate::util::hash::hash_bytes;

/// Fetch `source` into `download_dir`, returning the verified file.
///
/// `name` identifies the source in errors (formula or resource name).
pub async fn fetch(name: &str, source: &Source, download_dir: &Path) -> Result<PathBuf, BuildError> {
  let expected = source.sha256.to_ascii_lowercase();
  fs::create_dir_all(download_dir)
    .await
    .map_err(|e| BuildError::io(download_dir, e))?;

  let dest = download_dir.join(cache_filename(&expected, &source.url));
  if dest.exists() {
    match fs::read(&dest).await {
      Ok(bytes) if hash_bytes(&bytes).0 == expected => {
        debug!(path = %dest.display(), "using cached download");
        return Ok(dest);
      }
      _ => debug!(path = %dest.display(), "cached download invalid, fetching again"),
    }
  }

  let mut integrity_error = None;
  let mut failures = Vec::new();

  for url in source.urls() {
    info!(name, url, "fetching");
    let bytes = match download(url).await {
      Ok(bytes) => bytes,
      Err(message) => {
        warn!(name, url, error = %message, "fetch failed");
        failures.push(format!("{url}: {message}"));
        continue;
      }
    };

    let actual = hash_bytes(&bytes).0;
    if actual != expected {
      warn!(name, url, expected = %expected, actual = %actual, "checksum mismatch");
      integrity_error = Some(BuildError::Integrity {
        url: url.to_string(),
        expected: expected.clone(),
        actual,
      });
      continue;
    }

    let size = bytes.len();
    write_atomically(&dest, bytes).await?;
    info!(name, path = %dest.display(), size, "download verified");
    return Ok(dest);
  }

  Err(integrity_error.unwrap_or_else(|| BuildError::Fetch {
    name: name.to_string(),
    message: failures.join("; "),
  }))
}

async fn download(url: &str) -> Result<Vec<u8>, String> {
  if url.starts_with("http://") || url.starts_with("https://") {
    let response = reqwest::get(url).await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
      return Err(format!("HTTP {}", response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    return Ok(bytes.to_vec());
  }

  let path = url.strip_prefix("file://").unwrap_or(url);
  fs::read(path).await.map_err(|e| format!("{path}: {e}"))
}

/// Write through a uniquely named temporary file in the same directory, so
/// concurrent fetches of one source never share a partial file.
async fn write_atomically(dest: &Path, bytes: Vec<u8>) -> Result<(), BuildError> {
  let dir = dest.parent().unwrap_or(Path::new(".")).to_path_buf();
  let target = dest.to_path_buf();
  tokio::task::spawn_blocking(move || -> std::io::Result<()> {
    let mut file = tempfile::NamedTempFile::new_in(&dir)?;
    file.write_all(&bytes)?;
    file.persist(&target).map_err(|e| e.error)?;
    Ok(())
  })
  .await
  .map_err(|e| BuildError::io(dest, std::io::Error::other(e)))?
  .map_err(|e| BuildError::io(dest, e))
}

/// `<first 16 hex of sha256>-<sanitized last URL segment>`
pub fn cache_filename(sha256: &str, url: &str) -> String {
  let prefix: String = sha256.chars().take(16).collect();
  format!("{prefix}-{}", url_to_filename(url))
}

/// Last path segment of a URL, sanitized for use as a file name.
pub fn url_to_filename(url: &str) -> String {
  let segment = url.rsplit('/').next().unwrap_or(url);
  let segment = segment.split('?').next().unwrap_or(segment);

  let sanitized: String = segment
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect();

  if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
    format!("download_{}", &hash_bytes(url.as_bytes()).0[..16])
  } else {
    sanitized
  }
}

/// Archive formats `unpack` understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
  TarGz,
  TarXz,
  TarBz2,
  Tar,
  /// Copied as-is.
  Plain,
}

impl ArchiveKind {
  pub fn detect(path: &Path) -> Self {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
      ArchiveKind::TarGz
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
      ArchiveKind::TarXz
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
      ArchiveKind::TarBz2
    } else if name.ends_with(".tar") {
      ArchiveKind::Tar
    } else {
      ArchiveKind::Plain
    }
  }
}

/// Unpack `archive` so that its contents end up directly in `dest`.
///
/// Tarballs with a single top-level directory (`openssl-1.0.2h/...`) have
/// that directory stripped. Other files are copied into `dest` under their
/// cache-independent name.
pub async fn unpack(archive: &Path, dest: &Path, original_name: &str) -> Result<(), BuildError> {
  let kind = ArchiveKind::detect(Path::new(original_name));
  debug!(archive = %archive.display(), dest = %dest.display(), ?kind, "unpacking");

  if kind == ArchiveKind::Plain {
    fs::create_dir_all(dest).await.map_err(|e| BuildError::io(dest, e))?;
    let target = dest.join(original_name);
    fs::copy(archive, &target).await.map_err(|e| BuildError::io(&target, e))?;
    return Ok(());
  }

  let staging = dest.with_extension("unpack");
  let archive_path = archive.to_path_buf();
  let staging_dir = staging.clone();
  tokio::task::spawn_blocking(move || extract_tar(&archive_path, &staging_dir, kind))
    .await
    .map_err(|e| BuildError::io(archive, std::io::Error::other(e)))?
    .map_err(|e| BuildError::io(archive, e))?;

  let top = single_top_level_dir(&staging).map_err(|e| BuildError::io(&staging, e))?;
  let source_root = top.unwrap_or_else(|| staging.clone());
  fs::rename(&source_root, dest).await.map_err(|e| BuildError::io(dest, e))?;
  if staging.exists() {
    fs::remove_dir_all(&staging).await.map_err(|e| BuildError::io(&staging, e))?;
  }
  Ok(())
}

fn extract_tar(archive: &Path, dest: &Path, kind: ArchiveKind) -> std::io::Result<()> {
  std::fs::create_dir_all(dest)?;
  let file = std::fs::File::open(archive)?;
  match kind {
    ArchiveKind::TarGz => tar::Archive::new(GzDecoder::new(file)).unpack(dest),
    ArchiveKind::TarXz => tar::Archive::new(XzDecoder::new(file)).unpack(dest),
    ArchiveKind::TarBz2 => tar::Archive::new(BzDecoder::new(file)).unpack(dest),
    ArchiveKind::Tar | ArchiveKind::Plain => tar::Archive::new(file).unpack(dest),
  }
}

fn single_top_level_dir(dir: &Path) -> std::io::Result<Option<PathBuf>> {
  let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
  if entries.len() != 1 {
    return Ok(None);
  }
  let entry = entries.remove(0);
  Ok(entry.file_type()?.is_dir().then(|| entry.path()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{file_source as source_for, make_tarball};
  use tempfile::TempDir;

  #[test]
  fn url_to_filename_simple() {
    assert_eq!(url_to_filename("https://example.com/zlib-1.2.8.tar.gz"), "zlib-1.2.8.tar.gz");
  }

  #[test]
  fn url_to_filename_with_query() {
    assert_eq!(url_to_filename("https://example.com/file.tgz?token=abc"), "file.tgz");
  }

  #[test]
  fn url_to_filename_fallback_for_empty() {
    assert!(url_to_filename("https://example.com/").starts_with("download_"));
  }

  #[test]
  fn archive_kind_detection() {
    assert_eq!(ArchiveKind::detect(Path::new("boost_1_60_0.tar.gz")), ArchiveKind::TarGz);
    assert_eq!(ArchiveKind::detect(Path::new("v2.1.2.tgz")), ArchiveKind::TarGz);
    assert_eq!(ArchiveKind::detect(Path::new("libxml2-2.9.4.tar.xz")), ArchiveKind::TarXz);
    assert_eq!(ArchiveKind::detect(Path::new("bzip2-1.0.6.tar.bz2")), ArchiveKind::TarBz2);
    assert_eq!(ArchiveKind::detect(Path::new("src.tar")), ArchiveKind::Tar);
    assert_eq!(ArchiveKind::detect(Path::new("cacert.pem")), ArchiveKind::Plain);
  }

  #[tokio::test]
  async fn fetch_local_file_and_cache() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("cacert.pem");
    std::fs::write(&origin, b"certificate").unwrap();
    let source = source_for(&origin, b"certificate");
    let cache = temp.path().join("downloads");

    let first = fetch("cacert", &source, &cache).await.unwrap();
    assert_eq!(std::fs::read(&first).unwrap(), b"certificate");

    // Served from cache once the origin is gone
    std::fs::remove_file(&origin).unwrap();
    let second = fetch("cacert", &source, &cache).await.unwrap();
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn checksum_mismatch_is_integrity_error() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("lz4.tar.gz");
    std::fs::write(&origin, b"tampered").unwrap();
    let mut source = source_for(&origin, b"original");
    source.sha256 = source.sha256.to_uppercase();

    let err = fetch("lz4", &source, &temp.path().join("downloads")).await.unwrap_err();
    assert!(matches!(err, BuildError::Integrity { .. }));
    assert!(!temp.path().join("downloads").join(cache_filename(&hash_bytes(b"original").0, &source.url)).exists());
  }

  #[tokio::test]
  async fn concurrent_fetches_share_the_cache_entry() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("boost_1_60_0.tar.bz2");
    let payload = vec![7u8; 256 * 1024];
    std::fs::write(&origin, &payload).unwrap();
    let source = source_for(&origin, &payload);
    let cache = temp.path().join("downloads");

    let (a, b, c) = tokio::join!(
      fetch("boost", &source, &cache),
      fetch("boost", &source, &cache),
      fetch("boost", &source, &cache)
    );
    let path = a.unwrap();
    assert_eq!(path, b.unwrap());
    assert_eq!(path, c.unwrap());
    assert_eq!(std::fs::read(&path).unwrap(), payload);
    assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 1);
  }

  #[tokio::test]
  async fn falls_back_to_mirror() {
    let temp = TempDir::new().unwrap();
    let mirror = temp.path().join("mirror.tar.gz");
    std::fs::write(&mirror, b"payload").unwrap();
    let source = Source {
      url: format!("file://{}", temp.path().join("missing.tar.gz").display()),
      sha256: hash_bytes(b"payload").0,
      mirrors: vec![format!("file://{}", mirror.display())],
    };

    let path = fetch("snappy", &source, &temp.path().join("downloads")).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"payload");
  }

  #[tokio::test]
  async fn all_urls_failing_is_fetch_error() {
    let temp = TempDir::new().unwrap();
    let source = Source {
      url: format!("file://{}", temp.path().join("nope").display()),
      sha256: "00".repeat(32),
      mirrors: vec![],
    };

    let err = fetch("yara", &source, &temp.path().join("downloads")).await.unwrap_err();
    assert!(matches!(err, BuildError::Fetch { ref name, .. } if name == "yara"));
  }

  #[tokio::test]
  async fn unpack_strips_single_top_level_directory() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("zlib-1.2.8.tar.gz");
    make_tarball(&archive, "zlib-1.2.8", &[("configure", "#!/bin/sh\n"), ("zlib.h", "/* */")]);
    let dest = temp.path().join("work").join("src");

    unpack(&archive, &dest, "zlib-1.2.8.tar.gz").await.unwrap();
    assert!(dest.join("configure").exists());
    assert!(dest.join("zlib.h").exists());
    assert!(!temp.path().join("work").join("src.unpack").exists());
  }

  #[tokio::test]
  async fn unpack_xz_and_bzip2_tarballs() {
    let temp = TempDir::new().unwrap();
    for name in ["lz4-r131.tar.xz", "bzip2-1.0.6.tar.bz2", "gflags-2.1.2.tar"] {
      let archive = temp.path().join(format!("0123456789abcdef-{name}"));
      make_tarball(&archive, "top", &[("configure", "#!/bin/sh\n"), ("Makefile", "all:\n")]);
      let dest = temp.path().join(name).join("src");

      unpack(&archive, &dest, name).await.unwrap();
      assert!(dest.join("configure").is_file(), "{name} was not extracted");
      assert!(dest.join("Makefile").is_file());
      assert!(!dest.join(name).exists());
    }
  }

  #[tokio::test]
  async fn unpack_copies_plain_files() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("abc-cacert.pem");
    std::fs::write(&file, "pem").unwrap();
    let dest = temp.path().join("src");

    unpack(&file, &dest, "cacert.pem").await.unwrap();
    assert_eq!(std::fs::read_to_string(dest.join("cacert.pem")).unwrap(), "pem");
  }
}
