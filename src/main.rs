//! CLI for brokerctl
//!
//! Subcommands:
//! - `produce`: send each line typed on stdin to the configured destination
//! - `consume`: print every message received from the configured destination

use std::path::PathBuf;
use std::process::ExitCode;

use brokerctl::client;
use brokerctl::config::load_config;
use brokerctl::driver::Mode;
use brokerctl::utils::logging;
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "brokerctl", version, about)]
struct Cli {
    /// Configuration file layered over `config/default.*`
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log to stderr, overriding `app.debug`
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish lines typed on stdin
    Produce,
    /// Print messages consumed from the destination
    Consume,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let mut settings = match load_config(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    settings.app.debug |= cli.debug;
    logging::init(settings.app.debug, "info");

    let mode = match cli.command {
        Command::Produce => Mode::Producer,
        Command::Consume => Mode::Consumer,
    };
    info!(%mode, config = ?settings, "starting");

    match client::run(settings, mode).await {
        Ok(report) => {
            info!(reason = ?report.reason, "exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "client failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
