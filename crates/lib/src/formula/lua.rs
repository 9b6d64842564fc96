//! Lua catalog evaluation.
//!
//! A Lua catalog registers formulas through the `keg` global table:
//!
//! - `keg.platform` - Platform triple (e.g., "x86_64-linux")
//! - `keg.os` - Operating system name ("linux", "darwin", "windows")
//! - `keg.arch` - CPU architecture ("x86_64", "aarch64", "arm")
//! - `keg.dir` - Directory of the catalog file being evaluated
//! - `keg.formula{}` - Register a formula, returning its table
//! - `keg.reset(var)`, `keg.set(var, value)`, `keg.append(var, value)`,
//!   `keg.prepend(var, value)`, `keg.append_path(var, value)`,
//!   `keg.prepend_path(var, value)` - Environment operation constructors
//!
//! A chunk may also return a sequence of formula tables instead of (or in
//! addition to) calling `keg.formula`.
//!
//! Tables are converted with mlua's serde support, so a Lua formula has
//! exactly the shape of a JSON one. Empty list fields inside a step table
//! should be omitted rather than written as `{}`, which Lua cannot tell apart
//! from an empty map.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;

use super::{CatalogError, FormulaDef};
use crate::platform::Platform;

type Registry = Rc<RefCell<Vec<FormulaDef>>>;

/// Evaluate a Lua catalog file and return its formulas in declaration order.
pub fn load_formulas(path: &Path) -> Result<Vec<FormulaDef>, CatalogError> {
  let lua_err = |e: LuaError| CatalogError::Lua {
    path: path.to_path_buf(),
    message: e.to_string(),
  };

  let registry: Registry = Rc::new(RefCell::new(Vec::new()));
  let lua = create_runtime(registry.clone()).map_err(lua_err)?;
  let returned = load_file(&lua, path).map_err(lua_err)?;

  let mut formulas = registry.take();
  if let LuaValue::Table(table) = returned {
    for value in table.sequence_values::<LuaValue>() {
      let value = value.map_err(lua_err)?;
      formulas.push(lua.from_value(value).map_err(lua_err)?);
    }
  }

  Ok(formulas)
}

/// Create a Lua runtime with the `keg` global registered.
pub fn create_runtime(registry: Registry) -> LuaResult<Lua> {
  let lua = Lua::new();
  register_globals(&lua, registry)?;
  Ok(lua)
}

/// Register the `keg` global table.
pub fn register_globals(lua: &Lua, registry: Registry) -> LuaResult<()> {
  let keg = lua.create_table()?;

  let platform = Platform::current().ok_or_else(|| LuaError::external("unsupported platform"))?;
  keg.set("platform", platform.triple())?;
  keg.set("os", platform.os.as_str())?;
  keg.set("arch", platform.arch.as_str())?;

  let formula_fn = lua.create_function(move |lua, spec: LuaTable| {
    let def: FormulaDef = lua.from_value(LuaValue::Table(spec.clone()))?;
    tracing::debug!(formula = %def.label(), "registered formula");
    registry.borrow_mut().push(def);
    Ok(spec)
  })?;
  keg.set("formula", formula_fn)?;

  keg.set(
    "reset",
    lua.create_function(|lua, var: String| {
      let op = lua.create_table()?;
      op.set("op", "reset")?;
      op.set("var", var)?;
      Ok(op)
    })?,
  )?;
  for name in ["set", "append", "prepend", "append_path", "prepend_path"] {
    let constructor = lua.create_function(move |lua, (var, value): (String, String)| {
      let op = lua.create_table()?;
      op.set("op", name)?;
      op.set("var", var)?;
      op.set("value", value)?;
      Ok(op)
    })?;
    keg.set(name, constructor)?;
  }

  lua.globals().set("keg", keg)?;
  Ok(())
}

/// Execute a Lua file with `keg.dir` pointing at its directory.
pub fn load_file(lua: &Lua, path: &Path) -> LuaResult<LuaValue> {
  let canonical_path = dunce::canonicalize(path)
    .map_err(|e| LuaError::external(format!("cannot canonicalize '{}': {}", path.display(), e)))?;
  let content = std::fs::read_to_string(&canonical_path)
    .map_err(|e| LuaError::external(format!("cannot read '{}': {}", canonical_path.display(), e)))?;

  let keg: LuaTable = lua.globals().get("keg")?;
  keg.set(
    "dir",
    canonical_path
      .parent()
      .unwrap_or(Path::new(""))
      .to_string_lossy()
      .to_string(),
  )?;

  lua
    .load(&content)
    .set_name(format!("@{}", canonical_path.display()))
    .eval::<LuaValue>()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::env::EnvOp;
  use crate::formula::{BuildStep, DependencyKind};

  fn write_catalog(source: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("formulas.lua");
    std::fs::write(&path, source).unwrap();
    (dir, path)
  }

  #[test]
  fn keg_global_exposes_platform() -> LuaResult<()> {
    let lua = create_runtime(Rc::new(RefCell::new(Vec::new())))?;
    let platform: String = lua.load("return keg.platform").eval()?;
    let os: String = lua.load("return keg.os").eval()?;
    assert!(platform.ends_with(&os));
    Ok(())
  }

  #[test]
  fn formula_registrations_are_collected_in_order() {
    let (_dir, path) = write_catalog(
      r#"
      keg.formula { name = "zlib", version = "1.2.8" }
      keg.formula {
        name = "libxml2",
        version = "2.9.4",
        dependencies = { "zlib", { name = "python", kind = "optional" } },
        env = { keg.append("CFLAGS", "-fPIC") },
        exports = { keg.prepend_path("PKG_CONFIG_PATH", "$${prefix}/lib/pkgconfig") },
        options = { ["with-lite"] = { default = true, desc = "lite build" } },
        steps = {
          { step = "configure", args = { "--without-python" } },
          { step = "compile" },
          { step = "install" },
        },
      }
      "#,
    );

    let formulas = load_formulas(&path).unwrap();
    assert_eq!(formulas.len(), 2);
    assert_eq!(formulas[0].name, "zlib");

    let libxml2 = &formulas[1];
    assert_eq!(libxml2.dependencies[0].kind, DependencyKind::Build);
    assert_eq!(libxml2.dependencies[1].kind, DependencyKind::Optional);
    assert_eq!(
      libxml2.env,
      vec![EnvOp::Append {
        var: "CFLAGS".to_string(),
        value: "-fPIC".to_string()
      }]
    );
    assert!(libxml2.options["with-lite"].default);
    assert_eq!(libxml2.steps[1], BuildStep::compile(None));
  }

  #[test]
  fn returned_sequence_is_appended() {
    let (_dir, path) = write_catalog(
      r#"
      keg.formula { name = "a", version = "1" }
      return { { name = "b", version = "2" } }
      "#,
    );

    let names: Vec<_> = load_formulas(&path).unwrap().into_iter().map(|f| f.name).collect();
    assert_eq!(names, vec!["a", "b"]);
  }

  #[test]
  fn catalog_can_branch_on_os() {
    let (_dir, path) = write_catalog(
      r#"
      local def = { name = "glibc", version = "2.13" }
      if keg.os == "linux" then def.deparallelize = true end
      keg.formula(def)
      "#,
    );

    let formulas = load_formulas(&path).unwrap();
    assert_eq!(formulas[0].deparallelize, cfg!(target_os = "linux"));
  }

  #[test]
  fn syntax_error_names_file() {
    let (_dir, path) = write_catalog("keg.formula {");
    let err = load_formulas(&path).unwrap_err();
    assert!(matches!(err, CatalogError::Lua { .. }));
  }

  #[test]
  fn missing_version_is_an_error() {
    let (_dir, path) = write_catalog(r#"keg.formula { name = "x" }"#);
    assert!(load_formulas(&path).is_err());
  }
}
