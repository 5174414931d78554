// src/main.rs

use clap::Parser;
use color_eyre::eyre::Result;

mod cli;
mod core;
mod logging;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    logging::initialize_logging()?;

    let args = Cli::parse();
    // Only configuration and resource errors surface here; per-module
    // failures end up in the engagement error log and the summary instead.
    core::orchestrator::orchestrate(args).await
}
