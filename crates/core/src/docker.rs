//! Container-backed builds
//!
//! [`DockerContainerBuilder`] runs every step of a build inside a managed
//! docker container: it creates or starts the container, waits for it to
//! accept exec calls, copies the workdir in, and tears the container down on
//! every exit path. [`DockerStep`] is the adapter that lifts a base step's
//! command into `docker exec` as the configured container user, resolving
//! env-var injection against the container's own environment.

use crate::builder::Builder;
use crate::config::BuilderConfig;
use crate::errors::{DockerError, Result, ShellError};
use crate::manager::Manager;
use crate::messages::{now_timestamp, BuildInfo, BuildStatus};
use crate::plugins;
use crate::settings::Settings;
use crate::shell::{Exec, ShellExec, LIFECYCLE_CMD_TIMEOUT};
use crate::step::{Step, StepContext, StepSpec};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Delay between container liveness polls
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll budget for container start / service readiness
const WAIT_MAX_ATTEMPTS: u32 = 600;

/// Time budget for the in-container `env` probe
const ENV_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Builder variant that executes every step inside a managed container
pub struct DockerContainerBuilder {
    builder: Builder,
    image: String,
    cname: String,
    user: String,
    is_dind: bool,
    dind_volume: bool,
    exec: Arc<dyn Exec>,
}

impl std::fmt::Debug for DockerContainerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerContainerBuilder")
            .field("image", &self.image)
            .field("cname", &self.cname)
            .field("user", &self.user)
            .field("is_dind", &self.is_dind)
            .field("dind_volume", &self.dind_volume)
            .finish_non_exhaustive()
    }
}

impl DockerContainerBuilder {
    /// Create a container builder using the host docker CLI
    pub fn new(
        manager: Arc<dyn Manager>,
        conf: BuilderConfig,
        workdir: impl Into<PathBuf>,
        settings: &Settings,
        remove_env: bool,
        envvars: IndexMap<String, String>,
    ) -> Result<Self> {
        Self::with_exec(
            manager,
            conf,
            workdir,
            settings,
            remove_env,
            envvars,
            Arc::new(ShellExec),
        )
    }

    /// Create a container builder with an explicit command executor
    pub fn with_exec(
        manager: Arc<dyn Manager>,
        conf: BuilderConfig,
        workdir: impl Into<PathBuf>,
        settings: &Settings,
        remove_env: bool,
        envvars: IndexMap<String, String>,
        exec: Arc<dyn Exec>,
    ) -> Result<Self> {
        let image = settings.image_for(&conf.platform)?.to_string();
        let user = settings.container_user.clone();
        let is_dind = conf.platform.starts_with("docker");

        let mut plugins = plugins::load_plugins(&conf.plugins, &settings.plugins_data_dir)?;
        // Plugin data lives inside the container, not on the worker host.
        for plugin in &mut plugins {
            let dir =
                PathBuf::from(format!("/home/{}/plugins-data", user)).join(plugin.name());
            plugin.set_data_dir(dir);
        }

        let mut builder = Builder::with_plugins(
            manager, conf, workdir, settings, remove_env, envvars, plugins,
        )?;

        let short_id = builder.build_uuid().simple().to_string();
        let cname = format!(
            "{}-{}-{}",
            builder.manager.repo_id(),
            builder.conf.name,
            &short_id[..8]
        );

        // Lift every materialized step into the container.
        builder.steps = builder
            .steps
            .iter()
            .cloned()
            .map(|step| {
                Arc::new(DockerStep::new(
                    step,
                    cname.clone(),
                    user.clone(),
                    exec.clone(),
                )) as Arc<dyn Step>
            })
            .collect();

        Ok(Self {
            builder,
            image,
            cname,
            user,
            is_dind,
            dind_volume: true,
            exec,
        })
    }

    /// Name of the container owned by this build
    pub fn cname(&self) -> &str {
        &self.cname
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Whether this build runs a docker daemon inside its container
    pub fn is_dind(&self) -> bool {
        self.is_dind
    }

    /// Disable the named dind volume mount
    pub fn set_dind_volume(&mut self, enabled: bool) {
        self.dind_volume = enabled;
    }

    /// Run the build inside the container
    ///
    /// Container setup failures fail the whole build with `exception`;
    /// teardown runs on every path, including cancellation mid-step.
    pub async fn build(&self) -> Result<BuildInfo> {
        if let Err(err) = self.enter().await {
            error!("Container setup failed: {}", err);
            self.teardown().await;
            let now = now_timestamp();
            return Ok(BuildInfo {
                status: BuildStatus::Exception,
                started: now.clone(),
                finished: Some(now),
                steps: Vec::new(),
                total_steps: self.builder.steps.len(),
            });
        }

        let result = self.builder.run_steps().await;
        self.teardown().await;
        result
    }

    async fn enter(&self) -> Result<()> {
        self.start_container().await?;
        self.wait_service().await?;
        self.copy_to_container().await
    }

    /// Teardown runs best-effort on every path; failures are logged, never
    /// raised, because the build status is already decided.
    async fn teardown(&self) {
        if let Err(err) = self.kill_container().await {
            warn!("Failed to kill container {}: {}", self.cname, err);
        }
        if self.builder.remove_env {
            if let Err(err) = self.rm_container().await {
                warn!("Failed to remove container {}: {}", self.cname, err);
            }
        } else if let Err(err) = self.rm_from_container().await {
            warn!(
                "Failed to remove source dir from container {}: {}",
                self.cname, err
            );
        }
    }

    /// Create the container, or start it when it already exists
    pub async fn start_container(&self) -> Result<()> {
        let cmd = if self.container_exists().await {
            format!("docker start {}", self.cname)
        } else {
            format!(
                "docker run -d -t {} --name {} {}",
                self.dind_opts(),
                self.cname,
                self.image
            )
        };
        debug!("Starting container: {}", cmd);
        self.run(&cmd).await.map_err(lifecycle_err)?;
        self.wait_start().await
    }

    pub async fn kill_container(&self) -> Result<()> {
        self.run(&format!("docker kill {}", self.cname))
            .await
            .map_err(lifecycle_err)?;
        Ok(())
    }

    pub async fn rm_container(&self) -> Result<()> {
        self.run(&format!("docker rm -v {}", self.cname))
            .await
            .map_err(lifecycle_err)?;
        Ok(())
    }

    /// Copy the workdir into the container and hand it to the build user
    pub async fn copy_to_container(&self) -> Result<()> {
        let src_dir = self.src_dir();
        self.run(&format!(
            "docker cp {} {}:{}",
            self.builder.workdir.display(),
            self.cname,
            src_dir
        ))
        .await
        .map_err(lifecycle_err)?;
        self.run(&format!(
            "docker exec -u root -t {} chown -R {}:{} {}",
            self.cname, self.user, self.user, src_dir
        ))
        .await
        .map_err(lifecycle_err)?;
        Ok(())
    }

    /// Clear the source dir so a reused container starts the next build clean
    pub async fn rm_from_container(&self) -> Result<()> {
        self.run(&format!(
            "docker exec -u root {} rm -rf {}",
            self.cname,
            self.src_dir()
        ))
        .await
        .map_err(lifecycle_err)?;
        Ok(())
    }

    /// Whether a container with this build's name exists, running or not
    pub async fn container_exists(&self) -> bool {
        self.inspect_state().await.is_some()
    }

    /// Whether the container is currently running
    pub async fn is_running(&self) -> bool {
        matches!(
            self.inspect_state().await.as_deref().map(str::trim),
            Some("true")
        )
    }

    /// Probe that the container accepts exec calls; some images need
    /// post-start init before they do
    pub async fn service_is_up(&self) -> bool {
        self.run(&format!("docker exec {} true", self.cname))
            .await
            .is_ok()
    }

    /// Poll until the container reports running
    pub async fn wait_start(&self) -> Result<()> {
        for _ in 0..WAIT_MAX_ATTEMPTS {
            if self.is_running().await {
                return Ok(());
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        Err(DockerError::Lifecycle {
            message: format!("container {} did not start", self.cname),
        }
        .into())
    }

    /// Poll until the container accepts exec calls
    pub async fn wait_service(&self) -> Result<()> {
        for _ in 0..WAIT_MAX_ATTEMPTS {
            if self.service_is_up().await {
                return Ok(());
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        Err(DockerError::Lifecycle {
            message: format!("service in container {} did not come up", self.cname),
        }
        .into())
    }

    /// `docker inspect` with exit-code semantics: any failure means the
    /// container does not exist
    async fn inspect_state(&self) -> Option<String> {
        let cmd = format!(
            "docker inspect --format '{{{{.State.Running}}}}' {}",
            self.cname
        );
        self.run(&cmd).await.ok()
    }

    fn dind_opts(&self) -> String {
        if !self.is_dind {
            return " ".to_string();
        }
        let mut opts = String::from("--privileged ");
        if self.dind_volume {
            opts.push_str(&format!(
                "--mount source={}-{}-volume,destination=/var/lib/docker/",
                self.builder.manager.repo_id(),
                self.builder.conf.name
            ));
        }
        opts
    }

    fn src_dir(&self) -> String {
        format!("/home/{}/src", self.user)
    }

    async fn run(&self, cmd: &str) -> std::result::Result<String, ShellError> {
        self.exec
            .exec(
                cmd,
                Path::new("."),
                LIFECYCLE_CMD_TIMEOUT,
                &IndexMap::new(),
                None,
                &CancellationToken::new(),
            )
            .await
    }
}

fn lifecycle_err(err: ShellError) -> crate::errors::NavvyError {
    DockerError::Lifecycle {
        message: err.to_string(),
    }
    .into()
}

/// Adapter that executes a base step's command inside a container
///
/// Command resolution is delegated to the wrapped step, so dynamic steps
/// keep their behavior; only the execution path changes.
pub struct DockerStep {
    inner: Arc<dyn Step>,
    cname: String,
    user: String,
    exec: Arc<dyn Exec>,
}

impl DockerStep {
    pub fn new(inner: Arc<dyn Step>, cname: String, user: String, exec: Arc<dyn Exec>) -> Self {
        Self {
            inner,
            cname,
            user,
            exec,
        }
    }

    /// Read the container's baseline environment via `env`
    async fn container_env(&self) -> std::result::Result<IndexMap<String, String>, ShellError> {
        let out = self
            .exec
            .exec(
                &format!("docker exec {} env", self.cname),
                Path::new("."),
                ENV_PROBE_TIMEOUT,
                &IndexMap::new(),
                None,
                &CancellationToken::new(),
            )
            .await?;

        let mut env = IndexMap::new();
        for line in out.lines() {
            // Container output commonly carries trailing carriage returns.
            let line = line.trim_end_matches('\r');
            if let Some((key, value)) = line.split_once('=') {
                env.insert(key.to_string(), value.to_string());
            }
        }
        Ok(env)
    }

    /// Render the `export` prefix for the in-container command line
    ///
    /// A literal `:PATH` in a value is a templating token meaning "append
    /// the container's current value of this variable"; it is only expanded
    /// when the variable already exists in the container. Nothing else is
    /// templated.
    async fn cmd_line_envvars(
        &self,
        envvars: &IndexMap<String, String>,
    ) -> std::result::Result<String, ShellError> {
        if envvars.is_empty() {
            return Ok(String::new());
        }

        let container_env = self.container_env().await?;
        let mut prefix = String::new();
        for (key, value) in envvars {
            let mut value = value.clone();
            if let Some(current) = container_env.get(key) {
                if value.contains(":PATH") {
                    value = value.replace(":PATH", &format!(":{}", current));
                }
            }
            prefix.push_str(&format!("export {}={}; ", key, value));
        }
        Ok(prefix)
    }
}

#[async_trait]
impl Step for DockerStep {
    fn spec(&self) -> &StepSpec {
        self.inner.spec()
    }

    async fn command(&self) -> Result<String> {
        self.inner.command().await
    }

    async fn exec(
        &self,
        cmd: &str,
        ctx: &StepContext,
    ) -> std::result::Result<String, ShellError> {
        let envline = self.cmd_line_envvars(&ctx.envvars).await?;
        let src_dir = format!("/home/{}/src", self.user);
        let exec_cmd = format!(
            "docker exec -u {} {} /bin/bash -c '{}cd {} && {}'",
            self.user, self.cname, envline, src_dir, cmd
        );
        // The docker CLI itself runs on the worker host; env-vars travel
        // inside the command line, not through the CLI process.
        self.exec
            .exec(
                &exec_cmd,
                Path::new("."),
                self.spec().timeout,
                &IndexMap::new(),
                ctx.out_tx.clone(),
                &ctx.cancel,
            )
            .await
    }
}
