//! AppKeep CLI - per-application backup and restore
//!
//! This is the main entry point for the AppKeep command-line interface.

mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{CatalogCommands, Cli, Commands, KeyCommands};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI args
    let cli = Cli::parse();

    // Initialize tracing
    init_tracing(cli.verbose, cli.quiet);

    // Run command
    match cli.command {
        Commands::Backup(args) => commands::backup::run(args, &cli.global).await,
        Commands::Restore(args) => commands::restore::run(args, &cli.global).await,
        Commands::Verify(args) => commands::verify::run(args, &cli.global).await,
        Commands::Delete(args) => commands::delete::run(args, &cli.global).await,
        Commands::List(args) => commands::list::run(args, &cli.global),
        Commands::Migrate(args) => commands::migrate::run(args, &cli.global).await,
        Commands::Import(args) => commands::import::run(args, &cli.global).await,
        Commands::Catalog(CatalogCommands::Rebuild) => commands::catalog::rebuild(&cli.global),
        Commands::Key(KeyCommands::Generate(args)) => commands::key::generate(args),
    }
}

/// Initialize tracing with appropriate verbosity
fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            // Stage logs are shown by default; -v/-vv for per-archive detail
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
