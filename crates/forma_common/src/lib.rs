//! Shared foundational types used across the forma incremental-build core.
//!
//! This crate provides content fingerprints, the closed set of dependency node
//! kinds, and the atomic state cell every cache, graph and tracker builds on.

#![warn(missing_docs)]

pub mod fingerprint;
pub mod kind;
pub mod state_cell;

pub use fingerprint::Fingerprint;
pub use kind::{NodeKind, ParseNodeKindError, TOKEN_PREFIX};
pub use state_cell::StateCell;
