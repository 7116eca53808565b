//! Dependency tracking between source files, design tokens and pages.
//!
//! The [`DependencyGraph`] records which nodes depend on which, remembers the
//! content fingerprint of every tracked file, and answers the reverse
//! reachability queries that drive cascade invalidation.

#![warn(missing_docs)]

pub mod change;
pub mod fingerprint;
pub mod graph;
pub mod node;

pub use change::ChangeSet;
pub use fingerprint::{normalize_path, ContentFingerprinter, Fingerprinter};
pub use graph::DependencyGraph;
pub use node::{DependencyNode, NodeMetadata};
