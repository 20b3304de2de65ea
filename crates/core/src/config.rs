//! Builder configuration parsing
//!
//! The manager delivers one builder configuration per build as a YAML
//! document: a builder name, an optional platform tag, an ordered list of
//! steps, and an optional list of plugin configurations. A bare string in
//! `steps` is shorthand for a step whose name and command are both that
//! string.

use crate::errors::{ConfigError, Result};
use crate::step::StepSpec;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Default platform tag for builders that do not declare one
pub const DEFAULT_PLATFORM: &str = "linux-generic";

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

/// One builder configuration as delivered by the manager
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BuilderConfig {
    /// Builder name; also scopes the derived workspace directory
    pub name: String,

    /// Platform tag, used to select the container image
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Ordered list of build steps
    pub steps: Vec<StepConfig>,

    /// Plugin configurations, applied in declaration order
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

impl BuilderConfig {
    /// Parse a builder configuration from a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let conf: BuilderConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                message: e.to_string(),
            })?;
        debug!(
            "Parsed builder config '{}' with {} steps and {} plugins",
            conf.name,
            conf.steps.len(),
            conf.plugins.len()
        );
        Ok(conf)
    }
}

/// A step entry: either the bare-string shorthand or the detailed form
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum StepConfig {
    /// `- "make test"` — name and command are the same string
    Shorthand(String),
    /// The full `{name, command, timeout?, warning_on_fail?, stop_on_fail?}` form
    Detailed(StepDetail),
}

/// Detailed step configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDetail {
    pub name: String,
    pub command: String,
    /// Seconds the step may run before it is terminated
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Promote fail/exception outcomes to warning
    #[serde(default)]
    pub warning_on_fail: bool,
    /// Abort the build when this step fails
    #[serde(default)]
    pub stop_on_fail: bool,
}

impl StepConfig {
    /// Convert the config entry into a validated step spec
    pub fn to_spec(&self) -> Result<StepSpec> {
        match self {
            StepConfig::Shorthand(command) => StepSpec::new(command.clone(), command.clone()),
            StepConfig::Detailed(detail) => {
                let mut spec = StepSpec::new(detail.name.clone(), detail.command.clone())?
                    .warning_on_fail(detail.warning_on_fail)
                    .stop_on_fail(detail.stop_on_fail);
                if let Some(seconds) = detail.timeout {
                    spec = spec.timeout(Duration::from_secs(seconds));
                }
                Ok(spec)
            }
        }
    }
}

/// A plugin configuration entry, kept as raw YAML for registry dispatch
///
/// The `name` key selects the plugin; the remaining keys are forwarded to
/// the plugin's own configuration type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct PluginConfig(pub serde_yaml::Value);

impl PluginConfig {
    /// The plugin name declared in the entry, if any
    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(serde_yaml::Value::as_str)
    }
}
