//! Logging and observability
//!
//! This module provides structured logging initialization for the worker.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system
///
/// The filter is taken from `RUST_LOG` when set and defaults to `info`.
/// Safe to call once per process; callers embedding the core library may
/// install their own subscriber instead.
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::debug!("Logging initialized");
    Ok(())
}
