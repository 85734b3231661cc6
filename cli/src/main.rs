// aif binary entry point

mod cli;
mod commands;
mod shell;

use aif_common::bootstrap::{load_settings, AppContext};
use aif_common::telemetry;
use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::commands::{execute, Session};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(&cli.config)?;
    if let Some(level) = cli.log_level {
        settings.observability.log_level = level;
    }
    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.log_format,
    )?;
    telemetry::init_metrics(&settings.observability)?;
    info!(config = %cli.config.display(), "Configuration loaded");

    let ctx = AppContext::from_settings(settings)?;

    match cli.command {
        Commands::Shell => shell::run(&ctx).await,
        command => {
            let mut session = Session::default();
            let result = execute(&ctx, command, &mut session).await;
            // A one-shot `monitor start` keeps the process alive until sampling ends
            session.wait_all().await;
            result
        }
    }
}
