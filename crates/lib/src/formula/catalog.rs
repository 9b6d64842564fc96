//! The declaration-ordered formula collection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use super::FormulaDef;

#[derive(Debug, Error)]
pub enum CatalogError {
  #[error("failed to read catalog {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid JSON catalog {path}: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to evaluate Lua catalog {path}: {message}")]
  Lua { path: PathBuf, message: String },

  #[error("unsupported catalog format: {path} (expected .lua or .json)")]
  UnsupportedFormat { path: PathBuf },

  #[error("formula {name}@{version} is declared more than once")]
  Duplicate { name: String, version: String },

  #[error("invalid formula '{name}': {message}")]
  Invalid { name: String, message: String },
}

/// JSON catalogs are either a bare array or an object with a `formulas` key.
#[derive(Deserialize)]
#[serde(untagged)]
enum JsonCatalog {
  List(Vec<FormulaDef>),
  Object { formulas: Vec<FormulaDef> },
}

/// Read-only set of formulas in declaration order.
///
/// Several versions of one name may coexist; the resolver picks one per run.
/// Declaration index is the tie-break for every ordering decision.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
  formulas: Vec<FormulaDef>,
  by_name: HashMap<String, Vec<usize>>,
}

impl Catalog {
  /// Build a catalog, rejecting duplicate `name@version` pairs and records
  /// that are unusable regardless of what is requested.
  pub fn new(formulas: Vec<FormulaDef>) -> Result<Self, CatalogError> {
    let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();

    for (index, formula) in formulas.iter().enumerate() {
      validate(formula)?;

      let indices = by_name.entry(formula.name.clone()).or_default();
      if indices.iter().any(|&i| formulas[i].version == formula.version) {
        return Err(CatalogError::Duplicate {
          name: formula.name.clone(),
          version: formula.version.clone(),
        });
      }
      indices.push(index);
    }

    Ok(Self { formulas, by_name })
  }

  /// Load a catalog file, choosing the format from its extension.
  pub fn load(path: &Path) -> Result<Self, CatalogError> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let catalog = match extension {
      "lua" => Self::new(super::lua::load_formulas(path)?)?,
      "json" => {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
          path: path.to_path_buf(),
          source,
        })?;
        Self::from_json_str(&content, path)?
      }
      _ => {
        return Err(CatalogError::UnsupportedFormat {
          path: path.to_path_buf(),
        });
      }
    };

    info!(path = %path.display(), formulas = catalog.len(), "catalog loaded");
    Ok(catalog)
  }

  /// Parse a JSON catalog. `origin` is only used in error messages.
  pub fn from_json_str(content: &str, origin: &Path) -> Result<Self, CatalogError> {
    let parsed: JsonCatalog = serde_json::from_str(content).map_err(|source| CatalogError::Json {
      path: origin.to_path_buf(),
      source,
    })?;
    let formulas = match parsed {
      JsonCatalog::List(formulas) => formulas,
      JsonCatalog::Object { formulas } => formulas,
    };
    debug!(count = formulas.len(), "parsed JSON catalog");
    Self::new(formulas)
  }

  pub fn len(&self) -> usize {
    self.formulas.len()
  }

  pub fn is_empty(&self) -> bool {
    self.formulas.is_empty()
  }

  /// All formulas in declaration order.
  pub fn formulas(&self) -> &[FormulaDef] {
    &self.formulas
  }

  /// Formula at a declaration index.
  pub fn get(&self, index: usize) -> Option<&FormulaDef> {
    self.formulas.get(index)
  }

  /// Declaration indices of every record named `name`, in declaration order.
  pub fn candidates(&self, name: &str) -> &[usize] {
    self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn contains(&self, name: &str) -> bool {
    self.by_name.contains_key(name)
  }

  /// Declaration index of the record `name@version`.
  pub fn find(&self, name: &str, version: &str) -> Option<usize> {
    self
      .candidates(name)
      .iter()
      .copied()
      .find(|&i| self.formulas[i].version == version)
  }
}

fn validate(formula: &FormulaDef) -> Result<(), CatalogError> {
  let invalid = |message: String| CatalogError::Invalid {
    name: formula.name.clone(),
    message,
  };

  if formula.name.is_empty() {
    return Err(invalid("name must not be empty".to_string()));
  }
  if formula.name.contains(['/', '\\', '@', ':']) {
    return Err(invalid("name must not contain '/', '\\', '@' or ':'".to_string()));
  }
  if formula.version.is_empty() {
    return Err(invalid("version must not be empty".to_string()));
  }

  let mut seen = std::collections::HashSet::new();
  for resource in &formula.resources {
    if !seen.insert(resource.name.as_str()) {
      return Err(invalid(format!("resource '{}' is declared twice", resource.name)));
    }
  }

  if let Some(dep) = formula.dependencies.iter().find(|d| d.name == formula.name) {
    return Err(invalid(format!("depends on itself ({} dependency)", dep.kind)));
  }

  Ok(())
}
