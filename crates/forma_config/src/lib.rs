//! Parsing and validation of `forma.toml` configuration files.
//!
//! This crate reads the project configuration and produces a strongly-typed
//! [`FormaConfig`] covering the layered cache, incremental build passes and
//! the change watcher.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod resolve;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, load_config_or_default, CONFIG_FILE};
pub use resolve::{resolve_cache, ResolvedCache};
pub use types::*;
