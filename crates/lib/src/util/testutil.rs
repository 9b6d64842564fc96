//! Fixtures shared by tests across modules.

use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::formula::{BuildStep, Dependency, FormulaDef, Source};
use crate::util::hash::hash_bytes;

/// A `1.0` formula with build dependencies `deps` and one shell step.
pub fn shell_formula(name: &str, deps: &[&str], cmd: &str) -> FormulaDef {
  let mut def = FormulaDef::new(name, "1.0");
  def.dependencies = deps.iter().map(|d| Dependency::build(d)).collect();
  def.steps = vec![BuildStep::shell(cmd)];
  def
}

/// A `file://` source for `path`, whose checksum is that of `content`.
pub fn file_source(path: &Path, content: &[u8]) -> Source {
  Source {
    url: format!("file://{}", path.display()),
    sha256: hash_bytes(content).0,
    mirrors: vec![],
  }
}

/// Write a tarball at `path` holding `files` under the directory `top`.
///
/// Compression follows the extension: `.tar.gz`, `.tar.xz`, `.tar.bz2` or
/// a plain `.tar`.
pub fn make_tarball(path: &Path, top: &str, files: &[(&str, &str)]) {
  let mut builder = tar::Builder::new(Vec::new());
  for (name, content) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
      .append_data(&mut header, format!("{top}/{name}"), content.as_bytes())
      .unwrap();
  }
  let tar = builder.into_inner().unwrap();

  let name = path.to_string_lossy();
  let bytes = if name.ends_with(".tar.xz") {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
  } else if name.ends_with(".tar.bz2") {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
  } else if name.ends_with(".tar") {
    tar
  } else {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
  };
  std::fs::write(path, bytes).unwrap();
}
