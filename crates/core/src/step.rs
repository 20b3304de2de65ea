//! Build steps
//!
//! A step is one shell command executed as part of a build. The [`StepSpec`]
//! value carries the declarative attributes; the [`Step`] trait adds the
//! execution behavior, with override points for dynamic command resolution
//! (e.g. the apt plugin's install-vs-reconfigure choice) and for lifting
//! execution into a container.

use crate::errors::{ConfigError, Result, ShellError};
use crate::messages::BuildStatus;
use crate::shell::{self, OutputLine};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default step time budget, in seconds
pub const DEFAULT_STEP_TIMEOUT: u64 = 3600;

/// Declarative attributes of a build step
///
/// Two specs compare equal when their commands are equal.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    /// The shell command, with leading/trailing whitespace stripped
    pub command: String,
    pub timeout: Duration,
    /// Promote fail/exception outcomes to warning
    pub warning_on_fail: bool,
    /// Abort the build when this step fails
    pub stop_on_fail: bool,
}

impl StepSpec {
    /// Create a spec; the command must be non-empty after trimming
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let command = command.into().trim().to_string();
        if command.is_empty() {
            return Err(ConfigError::Validation {
                message: format!("step '{}' has an empty command", name),
            }
            .into());
        }
        Ok(Self {
            name,
            command,
            timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT),
            warning_on_fail: false,
            stop_on_fail: false,
        })
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn warning_on_fail(mut self, warning_on_fail: bool) -> Self {
        self.warning_on_fail = warning_on_fail;
        self
    }

    pub fn stop_on_fail(mut self, stop_on_fail: bool) -> Self {
        self.stop_on_fail = stop_on_fail;
        self
    }
}

impl PartialEq for StepSpec {
    fn eq(&self, other: &Self) -> bool {
        self.command == other.command
    }
}

/// The `{status, output}` pair produced by executing one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: BuildStatus,
    pub output: String,
}

/// Everything a step needs at execution time
///
/// The last-step fields are not consumed by plain command steps; they are
/// part of the contract for step implementations that branch on the
/// previous step's result.
#[derive(Debug)]
pub struct StepContext {
    /// Directory the command runs in
    pub cwd: PathBuf,
    /// Environment variables merged onto the inherited environment
    pub envvars: IndexMap<String, String>,
    /// Destination for streamed output lines; dropped when the step ends
    pub out_tx: Option<mpsc::Sender<OutputLine>>,
    /// Cooperative cancellation handle registered with the manager
    pub cancel: CancellationToken,
    pub last_step_status: Option<BuildStatus>,
    pub last_step_output: Option<String>,
}

/// One executable build step
#[async_trait]
pub trait Step: Send + Sync {
    fn spec(&self) -> &StepSpec;

    /// Resolve the command to execute. Dynamic steps override this; the
    /// result may differ from `spec().command`.
    async fn command(&self) -> Result<String> {
        Ok(self.spec().command.clone())
    }

    /// Run the resolved command. Container steps override this to lift the
    /// command into `docker exec`.
    async fn exec(
        &self,
        cmd: &str,
        ctx: &StepContext,
    ) -> std::result::Result<String, ShellError> {
        shell::exec_cmd(
            cmd,
            &ctx.cwd,
            self.spec().timeout,
            &ctx.envvars,
            ctx.out_tx.clone(),
            &ctx.cancel,
        )
        .await
    }

    /// Execute the step and classify the result into a [`StepOutcome`].
    /// Errors never escape: every failure mode maps to a terminal status.
    async fn run(&self, ctx: StepContext) -> StepOutcome {
        execute_step(self, ctx).await
    }
}

/// Default execution path: resolve, run, classify, promote
///
/// Kept as a free function so step implementations that override [`Step::run`]
/// can fall back to it after their own short-circuit checks.
pub async fn execute_step<S: Step + ?Sized>(step: &S, ctx: StepContext) -> StepOutcome {
    let cmd = match step.command().await {
        Ok(cmd) => cmd,
        Err(err) => {
            return StepOutcome {
                status: BuildStatus::Exception,
                output: err.to_string(),
            }
        }
    };

    let spec = step.spec();
    let (mut status, output) = match step.exec(&cmd, &ctx).await {
        Ok(output) => (BuildStatus::Success, output),
        Err(ShellError::Failed { output }) => (BuildStatus::Fail, output),
        Err(ShellError::Timeout { .. }) => (
            BuildStatus::Exception,
            format!(
                "{} has timed out in {} seconds",
                spec.command,
                spec.timeout.as_secs()
            ),
        ),
        Err(ShellError::Cancelled) => (BuildStatus::Cancelled, "Build cancelled".to_string()),
        Err(err @ ShellError::Spawn { .. }) => (BuildStatus::Exception, err.to_string()),
    };

    // Cancellation is never promoted.
    if spec.warning_on_fail && status.is_failure() {
        status = BuildStatus::Warning;
    }

    StepOutcome { status, output }
}

/// A plain shell command step
#[derive(Debug, Clone, PartialEq)]
pub struct CommandStep {
    spec: StepSpec,
}

impl CommandStep {
    pub fn new(spec: StepSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Step for CommandStep {
    fn spec(&self) -> &StepSpec {
        &self.spec
    }
}
