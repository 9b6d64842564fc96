//! keg-lib: Core types and logic for keg
//!
//! This crate provides the building blocks of the formula build orchestrator:
//! - `Formula`: immutable package records loaded from a catalog
//! - `Environment`: per-package build environments composed from contributions
//! - `BuildGraph`: the resolved, deterministically ordered dependency graph
//! - `execute`: the executor and the orchestrator driving a whole build run
//! - `Store`: the install tree holding completed builds

pub mod consts;
pub mod env;
pub mod execute;
pub mod formula;
pub mod placeholder;
pub mod platform;
pub mod resolve;
pub mod store;
pub mod util;
