mod bootstrap;
mod probe;

use anyhow::Result;
use clap::Parser;
use mimic_cli::{Cli, CliCommand};
use mimic_core::LogRotationPolicy;
use mimic_runtime::init_logging;

use crate::bootstrap::{build_runtime, load_bot_config};
use crate::probe::run_probe;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli).await
}

async fn run_cli(cli: Cli) -> Result<()> {
    let config = load_bot_config(&cli)?;
    init_logging(
        &config.log_file,
        config.debug_mode,
        LogRotationPolicy::from_env(),
    )?;

    match cli.command() {
        CliCommand::Run => {
            let runtime = build_runtime(&cli, &config)?;
            runtime.run().await
        }
        CliCommand::Probe(args) => run_probe(&config, &args).await,
    }
}
