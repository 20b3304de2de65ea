//! Core library for the navvy build worker
//!
//! This crate contains the build execution engine: builder configuration
//! parsing, step execution with streamed output, the plugin system, the
//! container-backed builder variant, the manager seam, logging, and error
//! handling.

pub mod builder;
pub mod config;
pub mod docker;
pub mod errors;
pub mod logging;
pub mod manager;
pub mod messages;
pub mod plugins;
pub mod settings;
pub mod shell;
pub mod step;

// Re-export IndexMap for use by dependent crates (preserves insertion order
// for env-var maps, where merge order is semantic)
pub use indexmap::IndexMap;

pub use errors::{NavvyError, Result};

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
