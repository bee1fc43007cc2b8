//! `upscalebus` entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

mod monitor_cmd;
mod recover_cmd;
mod run_cmd;

/// Batch upscaling bus for image archives.
#[derive(Debug, Parser)]
#[command(name = "upscalebus", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover, scan and process archives; keep watching unless --once.
    Run(run_cmd::RunArgs),
    /// Watch roots and forward discoveries to a running bus.
    Monitor(monitor_cmd::MonitorArgs),
    /// Reconcile ledger state against the filesystem and report it.
    Recover(recover_cmd::RecoverArgs),
}

fn init_logging() {
    // Logs go to stderr so `recover --json` output stays pipeable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Run(args) => run_cmd::run(cli.config.as_deref(), args).await,
        Command::Monitor(args) => monitor_cmd::run(cli.config.as_deref(), args).await,
        Command::Recover(args) => recover_cmd::run(cli.config.as_deref(), args).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}
