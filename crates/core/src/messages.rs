//! Progress messages
//!
//! Structured messages the builder streams to the manager while a build is
//! running: the build-level envelope, per-step start/terminal records, and
//! incremental step output chunks. Every message is a JSON-serializable map
//! discriminated by its `info_type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock timestamp format used in every message
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%z";

/// Format a UTC instant in the stable message timestamp format
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.format(TIMESTAMP_FORMAT).to_string()
}

/// Current UTC time in the stable message timestamp format
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Status vocabulary shared by steps and builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Running,
    Success,
    Warning,
    Fail,
    Exception,
    Cancelled,
}

impl BuildStatus {
    /// True for outcomes that trigger `stop_on_fail`
    pub fn is_failure(self) -> bool {
        matches!(self, BuildStatus::Fail | BuildStatus::Exception)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Warning => "warning",
            BuildStatus::Fail => "fail",
            BuildStatus::Exception => "exception",
            BuildStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-step record, sent once with `running` status when the step starts and
/// once with the terminal status when it finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Fresh identifier for this step execution
    pub uuid: Uuid,
    pub name: String,
    pub cmd: String,
    /// Position of the step in the materialized step list
    pub index: usize,
    pub status: BuildStatus,
    pub started: String,
    pub finished: Option<String>,
    /// Whole seconds between start and finish
    pub total_time: Option<u64>,
    pub output: String,
    pub last_step_finished: Option<String>,
    pub last_step_status: Option<BuildStatus>,
}

/// Incremental chunk of a step's output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutputInfo {
    /// Uuid of the step execution the chunk belongs to
    pub uuid: Uuid,
    /// Dense, 0-based chunk counter within the step
    pub output_index: u64,
    pub output: String,
}

/// Build-level envelope, emitted with `running` status at start; the final
/// aggregate is returned from the build loop for the manager to deliver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub status: BuildStatus,
    pub started: String,
    pub finished: Option<String>,
    /// Terminal step records, in execution order
    pub steps: Vec<StepInfo>,
    /// Length of the materialized step list, even on early abort
    pub total_steps: usize,
}

/// Any message sent to the manager, discriminated by `info_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "info_type")]
pub enum BuildEvent {
    #[serde(rename = "build_info")]
    Build(BuildInfo),
    #[serde(rename = "step_info")]
    Step(StepInfo),
    #[serde(rename = "step_output_info")]
    StepOutput(StepOutputInfo),
}
