//! Error types and handling
//!
//! Domain-specific error types for the build worker, grouped by subsystem.
//! Step-level shell failures are classified into step outcomes by the build
//! loop and never escape it; only configuration and infrastructure errors
//! propagate out of a build.

use thiserror::Error;

/// Top-level error type for the navvy worker
#[derive(Error, Debug)]
pub enum NavvyError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Shell execution errors
    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    /// Container runtime errors
    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    /// Plugin-related errors
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// The manager connection is gone; the build cannot report progress
    #[error("Manager error: {message}")]
    Manager { message: String },
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },

    /// Configuration file parsing error
    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Errors produced by shell command execution
#[derive(Error, Debug)]
pub enum ShellError {
    /// The command could not be spawned or awaited
    #[error("Failed to run command: {source}")]
    Spawn {
        #[from]
        source: std::io::Error,
    },

    /// The command exited with a non-zero status; carries the merged output
    #[error("Command failed:\n{output}")]
    Failed { output: String },

    /// The command exceeded its time budget
    #[error("Command timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// The command was cancelled from outside
    #[error("Command cancelled")]
    Cancelled,
}

/// Container lifecycle errors
#[derive(Error, Debug)]
pub enum DockerError {
    /// No image is configured for the requested platform
    #[error("No docker image configured for platform '{platform}'")]
    MissingImage { platform: String },

    /// A container lifecycle operation failed
    #[error("Container lifecycle error: {message}")]
    Lifecycle { message: String },
}

/// Plugin configuration and lookup errors
#[derive(Error, Debug)]
pub enum PluginError {
    /// The plugin name is not known to the registry
    #[error("Unknown plugin: '{name}'")]
    Unknown { name: String },

    /// The plugin configuration is missing required fields or malformed
    #[error("Bad plugin config: {message}")]
    BadConfig { message: String },
}

/// Convenience type alias for Results with NavvyError
pub type Result<T> = std::result::Result<T, NavvyError>;
