//! tiercache - two-tier build cache daemon
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tiercache::cli::{Cli, Commands};
use tiercache::config::ConfigManager;
use tiercache::error::ProxyResult;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ProxyResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    tiercache::logging::init(
        cli.verbose,
        cli.log_format.unwrap_or(config.general.log_format),
    );

    match cli.command {
        Commands::Serve(args) => tiercache::cli::commands::serve(args, &config).await,
        Commands::Config(args) => {
            tiercache::cli::commands::config(args, &config_manager, &config).await
        }
    }
}
