//! Undertow CLI - Command-line interface
//!
//! Runs the streaming scheduler against a simulated swarm and inspects how
//! the file selector treats a torrent's file list.

mod commands;
mod prompt;

use std::path::PathBuf;

use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Torrent streaming buffer and piece scheduler")]
struct Cli {
    /// Console log level (RUST_LOG overrides it)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the per-run trace log
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
