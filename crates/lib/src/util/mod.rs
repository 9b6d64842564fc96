//! Shared utilities.
//!
//! Hashing for fingerprints and install verification, plus test helpers.

pub mod hash;

#[cfg(test)]
pub mod testutil;
