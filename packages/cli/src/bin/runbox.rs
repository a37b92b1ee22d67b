use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod cli;

use cli::run::RunArgs;

#[derive(Parser)]
#[command(name = "runbox")]
#[command(about = "Runbox - run scripts as sandboxed background tasks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run script files in parallel, one task per file
    Run(RunArgs),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match handle_command(cli.command).await {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Run(args) => cli::run::execute(args).await,
    }
}

fn init_tracing() {
    // Logs go to stderr so --json output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env(runbox_config::constants::RUST_LOG)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
