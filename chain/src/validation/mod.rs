//! Block validity predicates for the chain.
//!
//! This module implements concrete block validators that plug into the
//! consensus layer via [`crate::consensus::validator::BlockValidator`].
//!
//! It currently provides:
//!
//! - [`integrity::IntegrityValidity`]: hash, signature, parent linkage,
//!   Merkle root and per-transaction signatures.
//! - [`base::BaseValidity`]: cheap structural and size checks.

pub mod base;
pub mod integrity;

pub use base::BaseValidity;
pub use integrity::IntegrityValidity;
