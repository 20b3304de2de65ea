//! Build orchestration
//!
//! A [`Builder`] executes one build: it materializes the step list from the
//! builder configuration and its plugins, prepares a scoped copy of the
//! workdir, runs the steps strictly in order while streaming progress
//! messages to the manager, and aggregates the terminal build status.

use crate::config::BuilderConfig;
use crate::errors::{NavvyError, Result};
use crate::manager::Manager;
use crate::messages::{
    now_timestamp, BuildEvent, BuildInfo, BuildStatus, StepInfo, StepOutputInfo,
};
use crate::plugins::{self, Plugin};
use crate::settings::Settings;
use crate::shell::{self, OUTPUT_CHANNEL_CAPACITY};
use crate::step::{CommandStep, Step, StepContext};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Executes the build steps of one builder configuration
pub struct Builder {
    pub(crate) manager: Arc<dyn Manager>,
    pub(crate) conf: BuilderConfig,
    pub(crate) workdir: PathBuf,
    pub(crate) remove_env: bool,
    pub(crate) envvars: IndexMap<String, String>,
    pub(crate) plugins: Vec<Box<dyn Plugin>>,
    pub(crate) steps: Vec<Arc<dyn Step>>,
    build_uuid: Uuid,
    output_buffer_len: usize,
}

impl Builder {
    /// Create a builder for one build
    ///
    /// Plugins are instantiated first; the step list is materialized
    /// afterwards because plugin steps sandwich the user-defined steps.
    pub fn new(
        manager: Arc<dyn Manager>,
        conf: BuilderConfig,
        workdir: impl Into<PathBuf>,
        settings: &Settings,
        remove_env: bool,
        envvars: IndexMap<String, String>,
    ) -> Result<Self> {
        let plugins = plugins::load_plugins(&conf.plugins, &settings.plugins_data_dir)?;
        Self::with_plugins(manager, conf, workdir, settings, remove_env, envvars, plugins)
    }

    pub(crate) fn with_plugins(
        manager: Arc<dyn Manager>,
        conf: BuilderConfig,
        workdir: impl Into<PathBuf>,
        settings: &Settings,
        remove_env: bool,
        envvars: IndexMap<String, String>,
        plugins: Vec<Box<dyn Plugin>>,
    ) -> Result<Self> {
        let steps = materialize_steps(&conf, &plugins)?;
        Ok(Self {
            manager,
            conf,
            workdir: workdir.into(),
            remove_env,
            envvars,
            plugins,
            steps,
            build_uuid: Uuid::new_v4(),
            output_buffer_len: settings.output_buffer_len,
        })
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    pub fn platform(&self) -> &str {
        &self.conf.platform
    }

    /// Identity the manager uses to cancel this build's running step
    pub fn build_uuid(&self) -> Uuid {
        self.build_uuid
    }

    /// The per-builder copy of the workdir steps actually execute in
    ///
    /// Scoping by builder name keeps parallel builders for the same
    /// repository from trampling each other.
    pub fn scoped_workdir(&self) -> PathBuf {
        let abs = if self.workdir.is_absolute() {
            self.workdir.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&self.workdir))
                .unwrap_or_else(|_| self.workdir.clone())
        };
        PathBuf::from(format!("{}-{}", abs.display(), self.conf.name))
    }

    /// Run the build inside the scoped workspace
    ///
    /// Workspace preparation failures produce an `exception` build result
    /// without running any step. The scoped copy is removed on the way out
    /// iff `remove_env` is set.
    pub async fn build(&self) -> Result<BuildInfo> {
        if let Err(err) = self.enter_workspace().await {
            error!("Workspace preparation failed: {}", err);
            let now = now_timestamp();
            return Ok(BuildInfo {
                status: BuildStatus::Exception,
                started: now.clone(),
                finished: Some(now),
                steps: Vec::new(),
                total_steps: self.steps.len(),
            });
        }

        let mut result = self.run_steps().await;

        if self.remove_env {
            if let Err(err) = self.remove_workspace().await {
                error!("Workspace removal failed: {}", err);
                if let Ok(info) = &mut result {
                    info.status = BuildStatus::Exception;
                }
            }
        }

        result
    }

    /// The build loop: emit the running envelope, execute every step in
    /// order, aggregate the terminal status
    pub(crate) async fn run_steps(&self) -> Result<BuildInfo> {
        let mut build_info = BuildInfo {
            status: BuildStatus::Running,
            started: now_timestamp(),
            finished: None,
            steps: Vec::new(),
            total_steps: self.steps.len(),
        };
        self.manager
            .send_info(BuildEvent::Build(build_info.clone()))
            .await?;

        let mut build_status: Option<BuildStatus> = None;
        let mut last_step_status: Option<BuildStatus> = None;
        let mut last_step_output: Option<String> = None;
        let mut last_step_finished: Option<String> = None;

        for (index, step) in self.steps.iter().enumerate() {
            let cmd = match step.command().await {
                Ok(cmd) => cmd,
                // Resolution failures surface through the execute path; the
                // declared command still identifies the step in messages.
                Err(err) => {
                    debug!("Command resolution failed: {}", err);
                    step.spec().command.clone()
                }
            };
            debug!("Executing {}", cmd);

            let step_uuid = Uuid::new_v4();
            let started = Instant::now();
            let mut step_info = StepInfo {
                uuid: step_uuid,
                name: step.spec().name.clone(),
                cmd,
                index,
                status: BuildStatus::Running,
                started: now_timestamp(),
                finished: None,
                total_time: None,
                output: String::new(),
                last_step_finished: last_step_finished.clone(),
                last_step_status,
            };
            self.manager
                .send_info(BuildEvent::Step(step_info.clone()))
                .await?;

            let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
            let cancel = CancellationToken::new();
            self.manager.add_build_task(self.build_uuid, cancel.clone());

            let ctx = StepContext {
                cwd: self.scoped_workdir(),
                envvars: self.merged_env_vars(),
                out_tx: Some(tx),
                cancel,
                last_step_status,
                last_step_output: last_step_output.clone(),
            };

            let mut buffer = StepOutputBuffer::new(step_uuid, self.output_buffer_len);
            let (outcome, forwarded) = tokio::join!(step.run(ctx), async {
                // Keep draining even after a send failure so the step's
                // output channel never backs up into the subprocess.
                let mut send_err: Option<NavvyError> = None;
                while let Some(line) = rx.recv().await {
                    if send_err.is_some() {
                        continue;
                    }
                    if let Some(msg) = buffer.push(line.line) {
                        if let Err(err) =
                            self.manager.send_info(BuildEvent::StepOutput(msg)).await
                        {
                            send_err = Some(err);
                        }
                    }
                }
                match send_err {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            });

            // Deregistration runs unconditionally, before any error propagates.
            self.manager.rm_build_task(self.build_uuid);
            forwarded?;

            if let Some(msg) = buffer.flush() {
                self.manager.send_info(BuildEvent::StepOutput(msg)).await?;
            }

            debug!("Finished {} with status {}", step_info.cmd, outcome.status);
            let finished = now_timestamp();
            step_info.status = outcome.status;
            step_info.output = outcome.output.clone();
            step_info.finished = Some(finished.clone());
            step_info.total_time = Some(started.elapsed().as_secs());
            self.manager
                .send_info(BuildEvent::Step(step_info.clone()))
                .await?;

            last_step_status = Some(outcome.status);
            last_step_output = Some(outcome.output);
            last_step_finished = Some(finished);

            // Once the build is past success it never improves.
            if matches!(build_status, None | Some(BuildStatus::Success)) {
                build_status = Some(outcome.status);
            }
            build_info.steps.push(step_info);

            if outcome.status == BuildStatus::Cancelled {
                break;
            }
            if outcome.status.is_failure() && step.spec().stop_on_fail {
                break;
            }
        }

        build_info.status = build_status.unwrap_or(BuildStatus::Success);
        build_info.finished = Some(now_timestamp());
        Ok(build_info)
    }

    /// Base env-vars overlaid with every plugin's contribution, in plugin
    /// order with the last writer winning
    pub(crate) fn merged_env_vars(&self) -> IndexMap<String, String> {
        let mut envvars = self.envvars.clone();
        for plugin in &self.plugins {
            for (key, value) in plugin.env_vars() {
                envvars.insert(key, value);
            }
        }
        envvars
    }

    async fn enter_workspace(&self) -> Result<()> {
        let scoped = self.scoped_workdir();
        debug!("Copying workdir to {}", scoped.display());
        shell::run_cmd(&format!("mkdir -p {}", scoped.display()), Path::new(".")).await?;
        shell::run_cmd(
            &format!("cp -R {}/* {}", self.workdir.display(), scoped.display()),
            Path::new("."),
        )
        .await?;
        Ok(())
    }

    async fn remove_workspace(&self) -> Result<()> {
        let scoped = self.scoped_workdir();
        debug!("Removing {}", scoped.display());
        shell::run_cmd(&format!("rm -rf {}", scoped.display()), Path::new(".")).await?;
        Ok(())
    }
}

/// `plugin_before ++ user_steps ++ plugin_after`, plugins in declaration order
pub(crate) fn materialize_steps(
    conf: &BuilderConfig,
    plugins: &[Box<dyn Plugin>],
) -> Result<Vec<Arc<dyn Step>>> {
    let mut before: Vec<Arc<dyn Step>> = Vec::new();
    let mut after: Vec<Arc<dyn Step>> = Vec::new();
    for plugin in plugins {
        before.extend(plugin.steps_before());
        after.extend(plugin.steps_after());
    }

    let mut steps = before;
    for sconf in &conf.steps {
        steps.push(Arc::new(CommandStep::new(sconf.to_spec()?)));
    }
    steps.extend(after);
    Ok(steps)
}

/// Per-step output batching state
///
/// Lines accumulate until their cumulative byte length exceeds the
/// threshold, then drain into one `step_output_info` chunk with a dense
/// 0-based `output_index`. A fresh buffer is created for every step, so
/// chunk counters can never leak across steps.
#[derive(Debug)]
pub(crate) struct StepOutputBuffer {
    step_uuid: Uuid,
    threshold: usize,
    lines: Vec<String>,
    byte_len: usize,
    next_index: u64,
}

impl StepOutputBuffer {
    pub(crate) fn new(step_uuid: Uuid, threshold: usize) -> Self {
        Self {
            step_uuid,
            threshold,
            lines: Vec::new(),
            byte_len: 0,
            next_index: 0,
        }
    }

    /// Buffer one line; returns a chunk when the threshold is crossed
    pub(crate) fn push(&mut self, line: String) -> Option<StepOutputInfo> {
        self.byte_len += line.len();
        self.lines.push(line);
        if self.byte_len > self.threshold {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Drain whatever is left after the step finished, if anything
    pub(crate) fn flush(&mut self) -> Option<StepOutputInfo> {
        if self.lines.is_empty() {
            None
        } else {
            Some(self.drain())
        }
    }

    fn drain(&mut self) -> StepOutputInfo {
        let output = self.lines.join("\n");
        let output = output.trim_matches('\n').to_string();
        self.lines.clear();
        self.byte_len = 0;
        let output_index = self.next_index;
        self.next_index += 1;
        StepOutputInfo {
            uuid: self.step_uuid,
            output_index,
            output,
        }
    }
}
