//! Public facade crate for `nerpipe`.
//!
//! This crate contains no IO or backend-specific logic.
//! It re-exports the snippet/entity types and the cache/recogniser traits from `nerpipe-core`.

pub use nerpipe_core::*;
