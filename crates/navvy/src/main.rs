use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging from core crate
    navvy_core::logging::init()?;

    // Parse CLI arguments
    let parsed = cli::Cli::parse();

    // Dispatch to CLI handler
    parsed.dispatch().await
}
