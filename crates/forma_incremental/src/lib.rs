//! Incremental compilation on top of the dependency graph and layered cache.
//!
//! Changed files are turned into an affected node set by the
//! [`InvalidationEngine`], ordered by the scheduler so dependencies build
//! before their dependents, and compiled through the
//! [`IncrementalOrchestrator`]. A [`ChangeWatcher`] can feed change batches
//! over a bounded channel.

#![warn(missing_docs)]

pub mod error;
pub mod invalidation;
pub mod orchestrator;
pub mod schedule;
pub mod state;
pub mod watch;

pub use error::{BoxError, IncrementalError};
pub use invalidation::{InvalidationEngine, InvalidationReport, InvalidationStrategy};
pub use orchestrator::{
    CompileOutcome, InFlightPolicy, IncrementalOrchestrator, PageCompiler, PassReport,
};
pub use schedule::{topological_levels, topological_sort};
pub use state::{CompilationState, CompilationTracker};
pub use watch::{ChangeBatch, ChangeWatcher};
