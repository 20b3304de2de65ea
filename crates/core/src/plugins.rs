//! Builder plugins
//!
//! Plugins contribute steps before and after the user-defined steps of a
//! build, plus environment variables for every step. They are selected by
//! name from the builder configuration; the remaining keys of a plugin
//! entry are that plugin's own configuration.
//!
//! Built-in plugins: `python-venv` (virtualenv creation + pip install) and
//! `apt-install` (apt package installation with an install-vs-reconfigure
//! choice made at execution time).

use crate::config::PluginConfig;
use crate::errors::{NavvyError, PluginError, Result};
use crate::messages::BuildStatus;
use crate::shell::{Exec, ShellExec};
use crate::step::{
    execute_step, CommandStep, Step, StepContext, StepOutcome, StepSpec, DEFAULT_STEP_TIMEOUT,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Time budget for quick package-state probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// A named component contributing steps and environment variables to a build
pub trait Plugin: Send + Sync {
    /// Registry name of the plugin
    fn name(&self) -> &'static str;

    /// Directory where the plugin stores persistent data
    fn data_dir(&self) -> &Path;

    /// Redirect the plugin's data directory (used by the container builder
    /// to point plugins at a container-local path)
    fn set_data_dir(&mut self, dir: PathBuf);

    /// Steps to run before the user-defined steps
    fn steps_before(&self) -> Vec<Arc<dyn Step>> {
        Vec::new()
    }

    /// Steps to run after the user-defined steps
    fn steps_after(&self) -> Vec<Arc<dyn Step>> {
        Vec::new()
    }

    /// Environment variables contributed to every step
    fn env_vars(&self) -> IndexMap<String, String> {
        IndexMap::new()
    }
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin").field("name", &self.name()).finish()
    }
}

/// Instantiate every plugin listed in a builder configuration, in order
pub fn load_plugins(
    configs: &[PluginConfig],
    plugins_data_dir: &Path,
) -> Result<Vec<Box<dyn Plugin>>> {
    configs
        .iter()
        .map(|conf| instantiate(conf, plugins_data_dir))
        .collect()
}

/// Instantiate one plugin from its configuration entry
pub fn instantiate(conf: &PluginConfig, plugins_data_dir: &Path) -> Result<Box<dyn Plugin>> {
    let name = conf.name().ok_or_else(|| PluginError::BadConfig {
        message: format!("plugin config {:?} does not have a name", conf.0),
    })?;

    debug!("Instantiating plugin '{}'", name);
    match name {
        PythonVenvPlugin::NAME => Ok(Box::new(PythonVenvPlugin::from_config(
            &conf.0,
            plugins_data_dir,
        )?)),
        AptInstallPlugin::NAME => Ok(Box::new(AptInstallPlugin::from_config(
            &conf.0,
            plugins_data_dir,
        )?)),
        other => Err(PluginError::Unknown {
            name: other.to_string(),
        }
        .into()),
    }
}

fn default_requirements_file() -> String {
    "requirements.txt".to_string()
}

#[derive(Debug, Deserialize)]
struct PythonVenvConfig {
    pyversion: String,
    #[serde(default = "default_requirements_file")]
    requirements_file: String,
    #[serde(default)]
    remove_env: bool,
    #[serde(default)]
    extra_indexes: Vec<String>,
}

/// Creates a virtualenv and installs requirements before the user steps
pub struct PythonVenvPlugin {
    pyversion: String,
    requirements_file: String,
    remove_env: bool,
    extra_indexes: Vec<String>,
    data_dir: PathBuf,
}

impl PythonVenvPlugin {
    pub const NAME: &'static str = "python-venv";

    fn from_config(value: &serde_yaml::Value, plugins_data_dir: &Path) -> Result<Self> {
        let conf: PythonVenvConfig =
            serde_yaml::from_value(value.clone()).map_err(|e| PluginError::BadConfig {
                message: e.to_string(),
            })?;
        Ok(Self {
            pyversion: conf.pyversion,
            requirements_file: conf.requirements_file,
            remove_env: conf.remove_env,
            extra_indexes: conf.extra_indexes,
            data_dir: plugins_data_dir.join(Self::NAME),
        })
    }

    /// Virtualenv location, scoped by python version
    pub fn venv_dir(&self) -> PathBuf {
        let sanitized = self.pyversion.replace(std::path::MAIN_SEPARATOR, "");
        self.data_dir.join(format!("venv-{}", sanitized))
    }
}

impl Plugin for PythonVenvPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    fn steps_before(&self) -> Vec<Arc<dyn Step>> {
        let venv_dir = self.venv_dir();
        let create = VenvCreateStep::new(&self.data_dir, venv_dir.clone(), &self.pyversion);

        let mut pip_cmd = format!("pip install -r {}", self.requirements_file);
        for index in &self.extra_indexes {
            pip_cmd.push_str(&format!(" --extra-index-url={}", index));
        }
        let install = CommandStep::new(StepSpec {
            name: "install dependencies using pip".to_string(),
            command: pip_cmd,
            timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT),
            warning_on_fail: false,
            stop_on_fail: true,
        });

        vec![Arc::new(create), Arc::new(install)]
    }

    fn steps_after(&self) -> Vec<Arc<dyn Step>> {
        if !self.remove_env {
            return Vec::new();
        }
        let remove = CommandStep::new(StepSpec {
            name: "remove venv".to_string(),
            command: format!("rm -rf {}", self.venv_dir().display()),
            timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT),
            warning_on_fail: false,
            stop_on_fail: false,
        });
        vec![Arc::new(remove)]
    }

    fn env_vars(&self) -> IndexMap<String, String> {
        // The `:PATH` suffix is expanded by the container step adapter;
        // outside a container the shell's own `$PATH` handling applies.
        let mut vars = IndexMap::new();
        vars.insert(
            "PATH".to_string(),
            format!("{}/bin:PATH", self.venv_dir().display()),
        );
        vars
    }
}

/// Venv-create step that skips its command when the venv already exists
#[derive(Debug, Clone)]
pub struct VenvCreateStep {
    spec: StepSpec,
    venv_dir: PathBuf,
}

impl VenvCreateStep {
    pub fn new(data_dir: &Path, venv_dir: PathBuf, pyversion: &str) -> Self {
        let command = format!(
            "mkdir -p {} && {} -m venv {}",
            data_dir.display(),
            pyversion,
            venv_dir.display()
        );
        Self {
            spec: StepSpec {
                name: "Create virtualenv".to_string(),
                command,
                timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT),
                warning_on_fail: false,
                stop_on_fail: true,
            },
            venv_dir,
        }
    }
}

#[async_trait]
impl Step for VenvCreateStep {
    fn spec(&self) -> &StepSpec {
        &self.spec
    }

    async fn run(&self, ctx: StepContext) -> StepOutcome {
        // An absolute venv dir overrides the cwd in the join, matching how
        // the data dir behaves when settings point it somewhere global.
        let python = ctx.cwd.join(self.venv_dir.join("bin").join("python"));
        if python.exists() {
            return StepOutcome {
                status: BuildStatus::Success,
                output: "venv exists. Skipping...".to_string(),
            };
        }
        execute_step(self, ctx).await
    }
}

/// Time budget for both apt steps. The plugin config accepts a `timeout`
/// key but the steps always run with this value.
const APT_STEP_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct AptInstallConfig {
    packages: Vec<String>,
}

/// Installs packages with apt before the user steps
pub struct AptInstallPlugin {
    packages: Vec<String>,
    data_dir: PathBuf,
    exec: Arc<dyn Exec>,
}

impl AptInstallPlugin {
    pub const NAME: &'static str = "apt-install";

    fn from_config(value: &serde_yaml::Value, plugins_data_dir: &Path) -> Result<Self> {
        let conf: AptInstallConfig =
            serde_yaml::from_value(value.clone()).map_err(|e| PluginError::BadConfig {
                message: e.to_string(),
            })?;
        Ok(Self {
            packages: conf.packages,
            data_dir: plugins_data_dir.join(Self::NAME),
            exec: Arc::new(ShellExec),
        })
    }
}

impl Plugin for AptInstallPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    fn steps_before(&self) -> Vec<Arc<dyn Step>> {
        let update = CommandStep::new(StepSpec {
            name: "Updating apt packages list".to_string(),
            command: "sudo apt-get update".to_string(),
            timeout: APT_STEP_TIMEOUT,
            warning_on_fail: false,
            stop_on_fail: true,
        });
        let install = AptInstallStep::new(
            self.packages.clone(),
            APT_STEP_TIMEOUT,
            self.exec.clone(),
        );
        vec![Arc::new(update), Arc::new(install)]
    }

    fn env_vars(&self) -> IndexMap<String, String> {
        let mut vars = IndexMap::new();
        vars.insert(
            "DEBIAN_FRONTEND".to_string(),
            "noninteractive".to_string(),
        );
        vars
    }
}

/// Install-or-reconfigure step with execution-time command resolution
///
/// The first `command()` call probes dpkg: when every requested package is
/// already present the step reconfigures instead of reinstalling. The
/// chosen command is cached for the rest of the step's life.
pub struct AptInstallStep {
    spec: StepSpec,
    packages: Vec<String>,
    install_cmd: String,
    reconf_cmd: String,
    resolved: OnceCell<String>,
    exec: Arc<dyn Exec>,
}

impl AptInstallStep {
    pub fn new(packages: Vec<String>, timeout: Duration, exec: Arc<dyn Exec>) -> Self {
        let packages_str = packages.join(" ");
        let install_cmd = format!("sudo apt-get install -y {}", packages_str);
        let reconf_cmd = format!("sudo dpkg-reconfigure {}", packages_str);
        Self {
            spec: StepSpec {
                name: "Installing packages with apt-get".to_string(),
                command: install_cmd.clone(),
                timeout,
                warning_on_fail: false,
                stop_on_fail: true,
            },
            packages,
            install_cmd,
            reconf_cmd,
            resolved: OnceCell::new(),
            exec,
        }
    }

    /// Whether every requested package shows up in dpkg's listing
    async fn everything_installed(&self) -> Result<bool> {
        let probe = format!(
            "sudo dpkg -l | egrep '{}' | wc -l",
            self.packages.join("|")
        );
        let out = self
            .exec
            .exec(
                &probe,
                Path::new("."),
                PROBE_TIMEOUT,
                &IndexMap::new(),
                None,
                &CancellationToken::new(),
            )
            .await?;
        let installed: usize = out.trim().parse().unwrap_or(0);
        Ok(installed == self.packages.len())
    }
}

#[async_trait]
impl Step for AptInstallStep {
    fn spec(&self) -> &StepSpec {
        &self.spec
    }

    async fn command(&self) -> Result<String> {
        let cmd = self
            .resolved
            .get_or_try_init(|| async {
                if self.everything_installed().await? {
                    Ok::<String, NavvyError>(self.reconf_cmd.clone())
                } else {
                    Ok(self.install_cmd.clone())
                }
            })
            .await?;
        Ok(cmd.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ShellError;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FakeExec {
        response: String,
        calls: Mutex<Vec<String>>,
    }

    impl FakeExec {
        fn new(response: &str) -> Self {
            Self {
                response: response.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Exec for FakeExec {
        async fn exec(
            &self,
            cmd: &str,
            _cwd: &Path,
            _timeout: Duration,
            _envvars: &IndexMap<String, String>,
            _out_tx: Option<mpsc::Sender<crate::shell::OutputLine>>,
            _cancel: &CancellationToken,
        ) -> std::result::Result<String, ShellError> {
            self.calls.lock().unwrap().push(cmd.to_string());
            Ok(self.response.clone())
        }
    }

    fn plugin_config(yaml: &str) -> PluginConfig {
        PluginConfig(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn test_unknown_plugin() {
        let conf = plugin_config("name: no-such-plugin");
        let err = instantiate(&conf, Path::new("/data")).unwrap_err();
        assert!(err.to_string().contains("Unknown plugin: 'no-such-plugin'"));
    }

    #[test]
    fn test_missing_name_is_bad_config() {
        let conf = plugin_config("pyversion: python3");
        let err = instantiate(&conf, Path::new("/data")).unwrap_err();
        assert!(err.to_string().contains("does not have a name"));
    }

    #[test]
    fn test_venv_plugin_steps() {
        let conf = plugin_config(
            "name: python-venv\npyversion: python3.11\nextra_indexes:\n  - https://a\n  - https://b\n",
        );
        let plugin = instantiate(&conf, Path::new("/data")).unwrap();
        assert_eq!(plugin.data_dir(), Path::new("/data/python-venv"));

        let before = plugin.steps_before();
        assert_eq!(before.len(), 2);
        assert_eq!(before[0].spec().name, "Create virtualenv");
        assert!(before[0].spec().command.contains("mkdir -p /data/python-venv"));
        assert!(before[0].spec().command.contains("python3.11 -m venv"));
        assert!(before[0].spec().stop_on_fail);
        assert_eq!(
            before[1].spec().command,
            "pip install -r requirements.txt --extra-index-url=https://a --extra-index-url=https://b"
        );
        assert!(before[1].spec().stop_on_fail);

        assert!(plugin.steps_after().is_empty());

        let env = plugin.env_vars();
        assert_eq!(
            env.get("PATH").unwrap(),
            "/data/python-venv/venv-python3.11/bin:PATH"
        );
    }

    #[test]
    fn test_venv_plugin_remove_env_step() {
        let conf = plugin_config("name: python-venv\npyversion: python3\nremove_env: true\n");
        let plugin = instantiate(&conf, Path::new("/data")).unwrap();
        let after = plugin.steps_after();
        assert_eq!(after.len(), 1);
        assert_eq!(
            after[0].spec().command,
            "rm -rf /data/python-venv/venv-python3"
        );
    }

    #[test]
    fn test_venv_dir_sanitizes_separators() {
        let conf = plugin_config("name: python-venv\npyversion: /usr/bin/python3\n");
        let plugin = instantiate(&conf, Path::new("/data")).unwrap();
        let env = plugin.env_vars();
        assert_eq!(
            env.get("PATH").unwrap(),
            "/data/python-venv/venv-usrbinpython3/bin:PATH"
        );
    }

    #[tokio::test]
    async fn test_venv_create_skips_when_venv_exists() {
        let cwd = tempfile::tempdir().unwrap();
        let venv_dir = PathBuf::from("venvs/venv-python3");
        let python_dir = cwd.path().join(&venv_dir).join("bin");
        std::fs::create_dir_all(&python_dir).unwrap();
        std::fs::write(python_dir.join("python"), "").unwrap();

        let step = VenvCreateStep::new(Path::new("venvs"), venv_dir, "python3");
        let outcome = step
            .run(StepContext {
                cwd: cwd.path().to_path_buf(),
                envvars: IndexMap::new(),
                out_tx: None,
                cancel: CancellationToken::new(),
                last_step_status: None,
                last_step_output: None,
            })
            .await;
        assert_eq!(outcome.status, BuildStatus::Success);
        assert_eq!(outcome.output, "venv exists. Skipping...");
    }

    #[tokio::test]
    async fn test_apt_install_when_packages_missing() {
        let exec = Arc::new(FakeExec::new("1"));
        let step = AptInstallStep::new(
            vec!["curl".to_string(), "jq".to_string()],
            Duration::from_secs(600),
            exec.clone(),
        );
        let cmd = step.command().await.unwrap();
        assert_eq!(cmd, "sudo apt-get install -y curl jq");
        assert_eq!(
            exec.calls(),
            vec!["sudo dpkg -l | egrep 'curl|jq' | wc -l".to_string()]
        );
    }

    #[tokio::test]
    async fn test_apt_reconfigure_when_everything_installed() {
        let exec = Arc::new(FakeExec::new("2"));
        let step = AptInstallStep::new(
            vec!["curl".to_string(), "jq".to_string()],
            Duration::from_secs(600),
            exec,
        );
        let cmd = step.command().await.unwrap();
        assert_eq!(cmd, "sudo dpkg-reconfigure curl jq");
    }

    #[tokio::test]
    async fn test_apt_command_is_cached() {
        let exec = Arc::new(FakeExec::new("1"));
        let step = AptInstallStep::new(
            vec!["curl".to_string()],
            Duration::from_secs(600),
            exec.clone(),
        );
        let first = step.command().await.unwrap();
        let second = step.command().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exec.calls().len(), 1);
    }

    #[test]
    fn test_apt_plugin_steps_and_env() {
        let conf = plugin_config("name: apt-install\npackages: [curl, jq]\ntimeout: 120\n");
        let plugin = instantiate(&conf, Path::new("/data")).unwrap();

        let before = plugin.steps_before();
        assert_eq!(before.len(), 2);
        assert_eq!(before[0].spec().command, "sudo apt-get update");
        assert!(before[0].spec().stop_on_fail);
        // The config's `timeout` key is accepted but the apt steps always
        // run with the fixed 600s budget.
        assert_eq!(before[0].spec().timeout, Duration::from_secs(600));
        assert_eq!(before[1].spec().timeout, Duration::from_secs(600));
        assert_eq!(before[1].spec().command, "sudo apt-get install -y curl jq");

        let env = plugin.env_vars();
        assert_eq!(env.get("DEBIAN_FRONTEND").unwrap(), "noninteractive");
    }
}
