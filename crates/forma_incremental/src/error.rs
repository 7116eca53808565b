//! Error types for incremental compilation.

use std::time::Duration;

use forma_cache::CacheError;
use thiserror::Error;

/// Error type returned by page compilers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while scheduling or running compilation.
#[derive(Debug, Error)]
pub enum IncrementalError {
    /// The node subset could not be ordered because it contains a cycle.
    #[error("dependency cycle: could not order {}", .unordered.join(", "))]
    Cycle {
        /// Every node left without a position, sorted.
        unordered: Vec<String>,
        /// The strongly connected components behind the failure, each sorted.
        cycles: Vec<Vec<String>>,
    },

    /// The compile callback failed for a page.
    #[error("failed to compile '{id}': {source}")]
    Compile {
        /// The page that failed.
        id: String,
        /// The callback's error.
        source: BoxError,
    },

    /// Writing a compiled artifact to the cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Another compilation of the same page did not finish in time.
    #[error("'{id}' still compiling after {waited:?}")]
    InFlightTimeout {
        /// The page being waited on.
        id: String,
        /// How long the caller waited.
        waited: Duration,
    },
}
