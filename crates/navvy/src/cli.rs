use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Worker-side CI build agent",
    long_about = "navvy executes the steps of one build — optionally inside a managed \
docker container — and reports progress the way a build coordinator would see it."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one build locally, emitting progress messages as JSON lines
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Builder configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Directory holding the prepared sources
    #[arg(long, short = 'w')]
    pub workdir: PathBuf,

    /// Worker settings file (TOML); built-in defaults apply when omitted
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Override the platform tag from the configuration
    #[arg(long)]
    pub platform: Option<String>,

    /// Run the steps inside a managed container
    #[arg(long)]
    pub docker: bool,

    /// Keep the build environment around after the build finishes
    #[arg(long)]
    pub keep_env: bool,

    /// Extra environment variables for the steps
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => crate::commands::run::execute(args).await,
        }
    }
}
