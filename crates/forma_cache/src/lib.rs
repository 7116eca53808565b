//! Layered artifact cache for incremental builds.
//!
//! A bounded in-memory LRU cache ([`MemoryCache`]) sits in front of a durable
//! one-file-per-entry store ([`DiskCache`]); [`LayeredCache`] combines the two
//! with read promotion and write-through. Entries are addressed by structured
//! [`CacheKey`]s naming the dependency node they were built from, so they can
//! be invalidated per node or in bulk through a [`KeyPattern`].

#![warn(missing_docs)]

pub mod disk;
pub mod error;
pub mod key;
pub mod layered;
pub mod memory;
pub mod pattern;
pub mod stats;

pub use disk::DiskCache;
pub use error::CacheError;
pub use key::CacheKey;
pub use layered::LayeredCache;
pub use memory::{MemoryCache, PutOptions};
pub use pattern::KeyPattern;
pub use stats::{CacheStats, LayeredStats};
