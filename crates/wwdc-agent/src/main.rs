//! WWDC Agent - headless frontend for the WWDC download orchestration

mod cli;
mod commands;

use clap::Parser;
use std::process::ExitCode;

use cli::{Cli, Command};
use commands::Agent;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    log::debug!("Starting WWDC agent v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> wwdc_core::Result<bool> {
    let agent = Agent::open(cli.db.as_deref(), cli.storage.as_deref())?;

    match cli.command {
        Command::Import { catalog } => {
            agent.import(&catalog)?;
        }
        Command::Sessions => agent.sessions()?,
        Command::Download { ids, streaming, sd } => {
            return agent.download(&ids, streaming, sd).await;
        }
        Command::Remove { ids } => agent.remove(&ids).await?,
        Command::List { pending } => agent.list(pending)?,
        Command::Settings { key, value } => agent.settings(key.as_deref(), value.as_deref())?,
        Command::Run => agent.run().await?,
    }
    Ok(true)
}
