//! Local build execution
//!
//! Runs one build on this machine with a stdout-backed manager: every
//! progress message the builder emits is printed as a JSON line, followed
//! by the final build envelope. The exit status reflects the build result.

use crate::cli::RunArgs;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use navvy_core::builder::Builder;
use navvy_core::config::BuilderConfig;
use navvy_core::docker::DockerContainerBuilder;
use navvy_core::manager::{BuildTaskRegistry, CancellationToken, Manager};
use navvy_core::messages::{BuildEvent, BuildStatus};
use navvy_core::settings::Settings;
use navvy_core::{IndexMap, NavvyError};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Manager that prints every progress message as one JSON line
struct StdoutManager {
    registry: BuildTaskRegistry,
}

#[async_trait]
impl Manager for StdoutManager {
    fn repo_id(&self) -> String {
        "local".to_string()
    }

    async fn send_info(&self, event: BuildEvent) -> navvy_core::Result<()> {
        let line = serde_json::to_string(&event).map_err(|e| NavvyError::Manager {
            message: e.to_string(),
        })?;
        println!("{line}");
        Ok(())
    }

    fn add_build_task(&self, build_uuid: Uuid, canceller: CancellationToken) {
        self.registry.register(build_uuid, canceller);
    }

    fn rm_build_task(&self, build_uuid: Uuid) {
        self.registry.unregister(build_uuid);
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let content = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let mut conf = BuilderConfig::from_yaml(&content)?;
    if let Some(platform) = args.platform {
        conf.platform = platform;
    }

    let mut envvars = IndexMap::new();
    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --env '{}', expected KEY=VALUE", pair))?;
        envvars.insert(key.to_string(), value.to_string());
    }

    let manager = Arc::new(StdoutManager {
        registry: BuildTaskRegistry::new(),
    });
    let remove_env = !args.keep_env;

    debug!(
        "Running builder '{}' in {} (docker: {})",
        conf.name,
        args.workdir.display(),
        args.docker
    );

    let info = if args.docker {
        DockerContainerBuilder::new(
            manager,
            conf,
            args.workdir.clone(),
            &settings,
            remove_env,
            envvars,
        )?
        .build()
        .await?
    } else {
        Builder::new(
            manager,
            conf,
            args.workdir.clone(),
            &settings,
            remove_env,
            envvars,
        )?
        .build()
        .await?
    };

    // Delivering the final envelope is the manager's job; locally that
    // manager is stdout.
    println!("{}", serde_json::to_string(&BuildEvent::Build(info.clone()))?);

    match info.status {
        BuildStatus::Success | BuildStatus::Warning => Ok(()),
        status => bail!("build finished with status {status}"),
    }
}
