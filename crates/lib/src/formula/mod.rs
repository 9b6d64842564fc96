//! Formula records and the catalog that holds them.
//!
//! A formula is an immutable description of one buildable package: where its
//! source lives, what it depends on, which environment contributions it makes
//! and the ordered steps that build and install it. Formulas are declared in a
//! catalog file (Lua or JSON) that is loaded once per run and never mutated.
//!
//! # Submodules
//!
//! - [`catalog`] - Declaration-ordered formula collection and loading
//! - [`lua`] - Lua catalog evaluation (`keg.formula{}`)

pub mod catalog;
pub mod lua;
mod types;

pub use catalog::{Catalog, CatalogError};
pub use types::*;
